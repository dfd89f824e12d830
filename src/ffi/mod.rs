use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;

/// Returned by `attach_current_thread` when the thread was already attached.
pub const BRIDGE_ATTACH_EXISTING: i32 = 0;
/// Returned by `attach_current_thread` when the call attached the thread.
pub const BRIDGE_ATTACH_NEW: i32 = 1;

/// Status codes returned by the entry points.
pub const BRIDGE_OK: i32 = 0;
pub const BRIDGE_ERR_UNINITIALIZED: i32 = -1;
pub const BRIDGE_ERR_INVALID_ARGUMENT: i32 = -2;
/// The callback object could not be registered (pin refused or capacity reached).
pub const BRIDGE_ERR_HANDLE: i32 = -3;

/// `BridgeHelperPoll` results; the exit code or signal goes to `out_value`.
pub const BRIDGE_HELPER_RUNNING: i32 = 0;
pub const BRIDGE_HELPER_EXITED: i32 = 1;
pub const BRIDGE_HELPER_SIGNALED: i32 = 2;

pub type AttachThreadFn = unsafe extern "C" fn(context: *mut c_void) -> i32;
pub type DetachThreadFn = unsafe extern "C" fn(context: *mut c_void);
pub type PinObjectFn = unsafe extern "C" fn(object: *mut c_void, context: *mut c_void) -> *mut c_void;
pub type UnpinObjectFn = unsafe extern "C" fn(object: *mut c_void, context: *mut c_void);
pub type HostProtectFn = unsafe extern "C" fn(object: *mut c_void, fd: i32, context: *mut c_void);
pub type HostResolveProcessFn = unsafe extern "C" fn(
    object: *mut c_void,
    protocol: i32,
    source: *const c_char,
    target: *const c_char,
    uid: i32,
    context: *mut c_void,
) -> *mut c_char;
pub type HostResultFn =
    unsafe extern "C" fn(object: *mut c_void, data: *const c_char, context: *mut c_void);
pub type HostFreeStringFn = unsafe extern "C" fn(value: *mut c_char, context: *mut c_void);

/// Function table the host glue installs once through `BridgeInit`.
///
/// The first four entries are host-runtime primitives (thread attachment and
/// object pinning); `protect`, `resolve_process` and `on_result` are the
/// resolved callback methods. Every entry is required.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeHostVTable {
    pub attach_current_thread: Option<AttachThreadFn>,
    pub detach_current_thread: Option<DetachThreadFn>,
    pub pin_object: Option<PinObjectFn>,
    pub unpin_object: Option<UnpinObjectFn>,
    pub protect: Option<HostProtectFn>,
    pub resolve_process: Option<HostResolveProcessFn>,
    pub on_result: Option<HostResultFn>,
    /// Releases strings returned by `resolve_process`.
    pub free_string: Option<HostFreeStringFn>,
    pub context: *mut c_void,
}

unsafe impl Send for BridgeHostVTable {}
unsafe impl Sync for BridgeHostVTable {}

/// Mirror of the `BridgeOptions` struct defined in `include/bridge.h`.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BridgeOptions {
    /// Detach threads the bridge attached once the callback returns.
    /// Off by default: callbacks come from a small set of long-lived engine workers.
    pub detach_after_callback: bool,
    /// Upper bound on simultaneously registered handles. 0 disables the limit.
    pub max_outstanding_handles: u32,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            detach_after_callback: false,
            max_outstanding_handles: 4096,
        }
    }
}

/// Parameters for `BridgeStartHelperProcess`. `udpgw_addr` and `dnsgw_addr`
/// may be null or empty.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BridgeHelperConfig {
    pub binary_path: *const c_char,
    pub tun_fd: i32,
    pub address: *const c_char,
    pub netmask: *const c_char,
    pub socks_server: *const c_char,
    pub udpgw_addr: *const c_char,
    pub dnsgw_addr: *const c_char,
}

pub type EngineProtectFn = unsafe extern "C" fn(handle: u64, fd: i32, context: *mut c_void);
pub type EngineResolveProcessFn = unsafe extern "C" fn(
    handle: u64,
    protocol: i32,
    source: *const c_char,
    target: *const c_char,
    uid: i32,
    context: *mut c_void,
) -> *mut c_char;
pub type EngineResultFn = unsafe extern "C" fn(handle: u64, data: *const c_char, context: *mut c_void);
pub type EngineReleaseFn = unsafe extern "C" fn(handle: u64, context: *mut c_void);
pub type EngineFreeStringFn = unsafe extern "C" fn(value: *mut c_char, context: *mut c_void);

/// Callbacks handed to the engine so its worker threads can reach the host.
///
/// Strings returned by `resolve_process` belong to the engine until it passes
/// them back through `free_string`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EngineCallbacks {
    pub protect: EngineProtectFn,
    pub resolve_process: EngineResolveProcessFn,
    pub on_result: EngineResultFn,
    pub release_object: EngineReleaseFn,
    pub free_string: EngineFreeStringFn,
    pub context: *mut c_void,
}

unsafe impl Send for EngineCallbacks {}
unsafe impl Sync for EngineCallbacks {}

#[repr(C)]
pub struct BridgeLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeCounters {
    pub handles_registered: u64,
    pub handles_released: u64,
    /// Release requests for ids that were already released.
    pub duplicate_releases: u64,
    /// Callback lookups against released or unknown handles.
    pub stale_lookups: u64,
    pub callbacks_dispatched: u64,
    pub callbacks_dropped: u64,
    pub attach_failures: u64,
    /// Second result deliveries against a one-shot handle.
    pub results_rejected: u64,
    pub helpers_launched: u64,
}

/// Borrows a C string for the duration of a call. Null stays `None`.
///
/// # Safety
/// `value` must be null or point to a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn borrow_c_str<'a>(value: *const c_char) -> Option<&'a CStr> {
    if value.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(value) })
    }
}

/// Borrows a C string as UTF-8; null and invalid UTF-8 both yield `None`.
///
/// # Safety
/// Same contract as [`borrow_c_str`].
pub(crate) unsafe fn borrow_str<'a>(value: *const c_char) -> Option<&'a str> {
    unsafe { borrow_c_str(value) }.and_then(|text| text.to_str().ok())
}

/// Hands a Rust string to foreign code. Must come back through [`free_owned_string`].
pub(crate) fn into_owned_string(value: String) -> *mut c_char {
    match CString::new(value) {
        Ok(text) => text.into_raw(),
        Err(error) => {
            // Truncate at the first NUL rather than failing the whole call.
            let position = error.nul_position();
            let mut bytes = error.into_vec();
            bytes.truncate(position);
            CString::new(bytes).map(CString::into_raw).unwrap_or(ptr::null_mut())
        }
    }
}

/// # Safety
/// `value` must be null or a pointer produced by [`into_owned_string`] that has
/// not been freed yet.
pub(crate) unsafe fn free_owned_string(value: *mut c_char) {
    if !value.is_null() {
        drop(unsafe { CString::from_raw(value) });
    }
}
