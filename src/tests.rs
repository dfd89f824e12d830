use super::*;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::CString;
use std::ptr;
use std::thread;
use std::time::Duration;

const PINNED: usize = 0x40_0000;

#[derive(Default)]
struct Recorder {
    pinned: Mutex<Vec<usize>>,
    unpinned: Mutex<Vec<usize>>,
    results: Mutex<Vec<(usize, String)>>,
}

static RECORDER: Lazy<Recorder> = Lazy::new(Recorder::default);

fn recorder<'a>(context: *mut c_void) -> &'a Recorder {
    unsafe { &*(context as *const Recorder) }
}

unsafe extern "C" fn attach(_context: *mut c_void) -> i32 {
    ffi::BRIDGE_ATTACH_EXISTING
}

unsafe extern "C" fn detach(_context: *mut c_void) {}

unsafe extern "C" fn pin(object: *mut c_void, context: *mut c_void) -> *mut c_void {
    recorder(context).pinned.lock().push(object as usize);
    ((object as usize) | PINNED) as *mut c_void
}

unsafe extern "C" fn unpin(object: *mut c_void, context: *mut c_void) {
    recorder(context).unpinned.lock().push(object as usize & !PINNED);
}

unsafe extern "C" fn protect(_object: *mut c_void, _fd: i32, _context: *mut c_void) {}

unsafe extern "C" fn resolve(
    _object: *mut c_void,
    _protocol: i32,
    _source: *const c_char,
    _target: *const c_char,
    _uid: i32,
    _context: *mut c_void,
) -> *mut c_char {
    ptr::null_mut()
}

unsafe extern "C" fn on_result(object: *mut c_void, data: *const c_char, context: *mut c_void) {
    let text = unsafe { CStr::from_ptr(data) }.to_string_lossy().into_owned();
    recorder(context)
        .results
        .lock()
        .push((object as usize & !PINNED, text));
}

unsafe extern "C" fn free_string(value: *mut c_char, _context: *mut c_void) {
    drop(unsafe { CString::from_raw(value) });
}

fn vtable() -> BridgeHostVTable {
    BridgeHostVTable {
        attach_current_thread: Some(attach),
        detach_current_thread: Some(detach),
        pin_object: Some(pin),
        unpin_object: Some(unpin),
        protect: Some(protect),
        resolve_process: Some(resolve),
        on_result: Some(on_result),
        free_string: Some(free_string),
        context: &*RECORDER as *const Recorder as *mut c_void,
    }
}

fn object(value: usize) -> *mut c_void {
    value as *mut c_void
}

// The bridge is process-wide, so its whole lifecycle is exercised in one test.
#[cfg(not(feature = "libclash"))]
#[test]
fn exported_surface_lifecycle() {
    let data = CString::new("{\"method\":\"ping\"}").unwrap();
    let system = CString::new("system").unwrap();
    let dns = CString::new("172.19.0.2").unwrap();

    unsafe {
        assert_eq!(BridgeInvokeAction(data.as_ptr(), object(0x50)), BRIDGE_ERR_UNINITIALIZED);
        let mut counters = BridgeCounters::default();
        assert!(!BridgeGetCounters(&mut counters));

        assert_eq!(BridgeInit(ptr::null(), ptr::null()), -1);

        let options = BridgeOptions::default();
        assert_eq!(BridgeInit(&vtable(), &options), BRIDGE_OK);
        assert_eq!(BridgeInit(&vtable(), &options), -3);

        assert_eq!(BridgeInvokeAction(data.as_ptr(), object(0x51)), BRIDGE_OK);
        assert_eq!(RECORDER.results.lock().as_slice(), &[(0x51, String::new())]);
        assert_eq!(RECORDER.unpinned.lock().as_slice(), &[0x51]);

        assert_eq!(BridgeInvokeAction(ptr::null(), object(0x52)), BRIDGE_ERR_INVALID_ARGUMENT);
        assert_eq!(
            BridgeInvokeAction(data.as_ptr(), ptr::null_mut()),
            BRIDGE_ERR_INVALID_ARGUMENT
        );
        assert_eq!(
            BridgeStartTun(4, object(0x53), system.as_ptr(), ptr::null(), dns.as_ptr()),
            BRIDGE_ERR_INVALID_ARGUMENT
        );
        assert!(!RECORDER.pinned.lock().contains(&0x52));
        assert!(!RECORDER.pinned.lock().contains(&0x53));

        assert_eq!(BridgeSetEventListener(object(0x61)), BRIDGE_OK);
        assert_eq!(BridgeSetEventListener(object(0x62)), BRIDGE_OK);
        assert_eq!(BridgeSetEventListener(ptr::null_mut()), BRIDGE_OK);
        assert_eq!(RECORDER.unpinned.lock().as_slice(), &[0x51, 0x61, 0x62]);

        let traffic = BridgeGetTraffic(true);
        assert!(!traffic.is_null());
        assert_eq!(CStr::from_ptr(traffic).to_bytes(), b"");
        BridgeStringFree(traffic);
        BridgeStringFree(BridgeGetTotalTraffic(false));

        BridgeUpdateDns(dns.as_ptr());
        BridgeUpdateDns(ptr::null());
        BridgeSuspend(true);
        BridgeForceGc();
        BridgeStopTun();

        assert!(BridgeGetCounters(&mut counters));
        assert_eq!(counters.handles_registered, 3);
        assert_eq!(counters.handles_released, 3);
        assert_eq!(counters.duplicate_releases, 0);
        assert_eq!(counters.results_rejected, 0);
        assert!(!BridgeGetCounters(ptr::null_mut()));
    }
}

#[test]
fn failed_init_is_not_retried() {
    let cell = OnceCell::new();
    let partial = BridgeHostVTable {
        on_result: None,
        ..vtable()
    };
    let missing = InitError::MissingMethod("on_result");

    assert_eq!(
        init_once(&cell, &partial, BridgeOptions::default()),
        Err(missing.clone())
    );
    assert_eq!(
        init_once(&cell, &vtable(), BridgeOptions::default()),
        Err(missing.clone())
    );
    assert_eq!(missing.status(), -2);
    assert!(ready(&cell).is_none());
}

#[cfg(not(feature = "libclash"))]
#[test]
fn successful_init_happens_once() {
    let cell = OnceCell::new();
    assert_eq!(init_once(&cell, &vtable(), BridgeOptions::default()), Ok(()));
    assert_eq!(
        init_once(&cell, &vtable(), BridgeOptions::default()),
        Err(InitError::AlreadyInitialized)
    );
    assert!(ready(&cell).is_some());
}

#[test]
fn helper_process_through_the_c_abi() {
    let binary = CString::new("/nonexistent/tun-bridge/helper").unwrap();
    let address = CString::new("172.19.0.1").unwrap();
    let netmask = CString::new("255.255.255.252").unwrap();
    let socks = CString::new("127.0.0.1:7777").unwrap();
    let config = BridgeHelperConfig {
        binary_path: binary.as_ptr(),
        tun_fd: 3,
        address: address.as_ptr(),
        netmask: netmask.as_ptr(),
        socks_server: socks.as_ptr(),
        udpgw_addr: ptr::null(),
        dnsgw_addr: ptr::null(),
    };

    unsafe {
        assert_eq!(BridgeStartHelperProcess(ptr::null()), LAUNCH_FAILED_PID);
        let missing = BridgeHelperConfig {
            address: ptr::null(),
            ..config
        };
        assert_eq!(BridgeStartHelperProcess(&missing), LAUNCH_FAILED_PID);

        let pid = BridgeStartHelperProcess(&config);
        assert!(pid > 0);

        let mut value = -1;
        let mut status = BRIDGE_HELPER_RUNNING;
        for _ in 0..500 {
            status = BridgeHelperPoll(pid, &mut value);
            if status != BRIDGE_HELPER_RUNNING {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(status, BRIDGE_HELPER_EXITED);
        assert_eq!(value, supervisor::EXEC_FAILED_STATUS);

        // Already reaped.
        assert_eq!(BridgeHelperPoll(pid, &mut value), BRIDGE_ERR_INVALID_ARGUMENT);
    }
    assert_eq!(BridgeHelperTerminate(0, false), BRIDGE_ERR_INVALID_ARGUMENT);
    assert_eq!(BridgeHelperTerminate(-5, true), BRIDGE_ERR_INVALID_ARGUMENT);
}
