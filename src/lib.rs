#![deny(unsafe_op_in_unsafe_fn)]

mod attach;
mod bridge;
mod counters;
mod dispatch;
mod engine;
pub mod ffi;
mod host;
pub mod logger;
mod registry;
pub mod supervisor;
#[cfg(test)]
mod test_support;

use crate::bridge::Bridge;
use crate::engine::TunnelEngine;
use crate::ffi::{
    BridgeCounters, BridgeHelperConfig, BridgeHostVTable, BridgeLogSink, BridgeOptions,
    BRIDGE_ERR_HANDLE, BRIDGE_ERR_INVALID_ARGUMENT, BRIDGE_ERR_UNINITIALIZED,
    BRIDGE_HELPER_EXITED, BRIDGE_HELPER_RUNNING, BRIDGE_HELPER_SIGNALED, BRIDGE_OK,
};
use crate::host::{HostObject, HostRuntime, InitError, MethodTable, VTableHost};
use crate::logger::BreadcrumbFlags;
use crate::supervisor::{HelperConfig, HelperExit, LAUNCH_FAILED_PID};
use once_cell::sync::OnceCell;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::sync::Arc;

/// The first initialization outcome. A failure stays recorded, so later
/// `BridgeInit` calls report it again instead of retrying.
type InitOutcome = Result<Bridge, InitError>;

static BRIDGE: OnceCell<InitOutcome> = OnceCell::new();

fn init_once(
    cell: &OnceCell<InitOutcome>,
    vtable: &BridgeHostVTable,
    options: BridgeOptions,
) -> Result<(), InitError> {
    let mut created = false;
    let outcome = cell.get_or_init(|| {
        created = true;
        let methods = MethodTable::resolve(vtable)?;
        let host: Arc<dyn HostRuntime> = Arc::new(VTableHost::new(methods));
        Ok(Bridge::new(host, default_engine(), options))
    });
    match outcome {
        Ok(_) if created => Ok(()),
        Ok(_) => Err(InitError::AlreadyInitialized),
        Err(error) => Err(error.clone()),
    }
}

fn ready(cell: &OnceCell<InitOutcome>) -> Option<&Bridge> {
    cell.get().and_then(|outcome| outcome.as_ref().ok())
}

#[cfg(feature = "libclash")]
fn default_engine() -> Arc<dyn TunnelEngine> {
    Arc::new(engine::LinkedEngine::new())
}

#[cfg(not(feature = "libclash"))]
fn default_engine() -> Arc<dyn TunnelEngine> {
    logger::warn("built without libclash; engine calls are ignored");
    Arc::new(engine::NullEngine::new())
}

fn bridge(entry: &str) -> Option<&'static Bridge> {
    let bridge = ready(&BRIDGE);
    if bridge.is_none() {
        logger::warn(format!("{entry} called before BridgeInit"));
    }
    bridge
}

/// Borrows a required string argument, logging which one was missing.
///
/// # Safety
/// `value` must be null or a NUL-terminated string valid for the call.
unsafe fn required<'a>(entry: &str, name: &str, value: *const c_char) -> Option<&'a CStr> {
    let text = unsafe { ffi::borrow_c_str(value) };
    if text.is_none() {
        logger::warn(format!("{entry}: `{name}` is null"));
    }
    text
}

/// Resolves the host method table and creates the process-wide bridge. Must
/// run once, before any other entry point except the logging ones. A failed
/// initialization is final: every later call returns the same error.
#[no_mangle]
pub unsafe extern "C" fn BridgeInit(
    vtable: *const BridgeHostVTable,
    options: *const BridgeOptions,
) -> i32 {
    let Some(vtable) = (unsafe { vtable.as_ref() }) else {
        logger::error("BridgeInit: host vtable is null");
        return InitError::NullVTable.status();
    };
    let options = unsafe { options.as_ref() }.copied().unwrap_or_default();
    match init_once(&BRIDGE, vtable, options) {
        Ok(()) => BRIDGE_OK,
        Err(error) => {
            logger::error(format!("BridgeInit failed: {error}"));
            error.status()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeStartTun(
    fd: i32,
    callback: *mut c_void,
    stack: *const c_char,
    address: *const c_char,
    dns: *const c_char,
) -> i32 {
    let Some(bridge) = bridge("BridgeStartTun") else {
        return BRIDGE_ERR_UNINITIALIZED;
    };
    let Some(callback) = HostObject::from_raw(callback) else {
        logger::warn("BridgeStartTun: callback is null");
        return BRIDGE_ERR_INVALID_ARGUMENT;
    };
    let (Some(stack), Some(address), Some(dns)) = (unsafe {
        (
            required("BridgeStartTun", "stack", stack),
            required("BridgeStartTun", "address", address),
            required("BridgeStartTun", "dns", dns),
        )
    }) else {
        return BRIDGE_ERR_INVALID_ARGUMENT;
    };
    match bridge.start_tun(fd, callback, stack, address, dns) {
        Ok(_) => BRIDGE_OK,
        Err(error) => {
            logger::error(format!("BridgeStartTun: {error}"));
            BRIDGE_ERR_HANDLE
        }
    }
}

#[no_mangle]
pub extern "C" fn BridgeStopTun() {
    if let Some(bridge) = bridge("BridgeStopTun") {
        bridge.stop_tun();
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeUpdateDns(dns: *const c_char) {
    let Some(bridge) = bridge("BridgeUpdateDns") else {
        return;
    };
    if let Some(dns) = unsafe { required("BridgeUpdateDns", "dns", dns) } {
        bridge.update_dns(dns);
    }
}

#[no_mangle]
pub extern "C" fn BridgeForceGc() {
    if let Some(bridge) = bridge("BridgeForceGc") {
        bridge.force_gc();
    }
}

/// The single result arrives later through the host `on_result` method.
#[no_mangle]
pub unsafe extern "C" fn BridgeInvokeAction(data: *const c_char, callback: *mut c_void) -> i32 {
    let Some(bridge) = bridge("BridgeInvokeAction") else {
        return BRIDGE_ERR_UNINITIALIZED;
    };
    let Some(callback) = HostObject::from_raw(callback) else {
        logger::warn("BridgeInvokeAction: callback is null");
        return BRIDGE_ERR_INVALID_ARGUMENT;
    };
    let Some(data) = (unsafe { required("BridgeInvokeAction", "data", data) }) else {
        return BRIDGE_ERR_INVALID_ARGUMENT;
    };
    match bridge.invoke_action(data, callback) {
        Ok(_) => BRIDGE_OK,
        Err(error) => {
            logger::error(format!("BridgeInvokeAction: {error}"));
            BRIDGE_ERR_HANDLE
        }
    }
}

/// A null `listener` clears the current one.
#[no_mangle]
pub unsafe extern "C" fn BridgeSetEventListener(listener: *mut c_void) -> i32 {
    let Some(bridge) = bridge("BridgeSetEventListener") else {
        return BRIDGE_ERR_UNINITIALIZED;
    };
    match bridge.set_event_listener(HostObject::from_raw(listener)) {
        Ok(_) => BRIDGE_OK,
        Err(error) => {
            logger::error(format!("BridgeSetEventListener: {error}"));
            BRIDGE_ERR_HANDLE
        }
    }
}

/// Returns an owned string; release it with `BridgeStringFree`.
#[no_mangle]
pub extern "C" fn BridgeGetTraffic(only_proxies: bool) -> *mut c_char {
    let traffic = bridge("BridgeGetTraffic")
        .map(|bridge| bridge.get_traffic(only_proxies))
        .unwrap_or_default();
    ffi::into_owned_string(traffic)
}

/// Returns an owned string; release it with `BridgeStringFree`.
#[no_mangle]
pub extern "C" fn BridgeGetTotalTraffic(only_proxies: bool) -> *mut c_char {
    let traffic = bridge("BridgeGetTotalTraffic")
        .map(|bridge| bridge.get_total_traffic(only_proxies))
        .unwrap_or_default();
    ffi::into_owned_string(traffic)
}

#[no_mangle]
pub extern "C" fn BridgeSuspend(suspended: bool) {
    if let Some(bridge) = bridge("BridgeSuspend") {
        bridge.suspend(suspended);
    }
}

/// Forks and execs the helper binary. Returns its pid, or -1 when the launch
/// failed in this process. A failed exec shows up only as exit status 127.
#[no_mangle]
pub unsafe extern "C" fn BridgeStartHelperProcess(config: *const BridgeHelperConfig) -> i32 {
    let Some(raw) = (unsafe { config.as_ref() }) else {
        logger::warn("BridgeStartHelperProcess: config is null");
        return LAUNCH_FAILED_PID;
    };
    let Some(config) = (unsafe { HelperConfig::from_ffi(raw) }) else {
        logger::warn("BridgeStartHelperProcess: a required string is null or not UTF-8");
        return LAUNCH_FAILED_PID;
    };
    // Launching does not touch handles, so it also works before BridgeInit.
    let launched = match ready(&BRIDGE) {
        Some(bridge) => bridge.start_helper_process(&config),
        None => supervisor::launch(&config),
    };
    match launched {
        Ok(helper) => helper.pid(),
        Err(error) => {
            logger::error(format!("BridgeStartHelperProcess: {error}"));
            LAUNCH_FAILED_PID
        }
    }
}

/// Sends SIGTERM, or SIGKILL when `force` is set.
#[no_mangle]
pub extern "C" fn BridgeHelperTerminate(pid: i32, force: bool) -> i32 {
    let result = if force {
        supervisor::force_kill(pid)
    } else {
        supervisor::terminate(pid)
    };
    match result {
        Ok(()) => BRIDGE_OK,
        Err(error) => {
            logger::warn(format!("BridgeHelperTerminate(pid={pid}): {error}"));
            BRIDGE_ERR_INVALID_ARGUMENT
        }
    }
}

/// Non-blocking exit check. Reaps the helper once it has exited.
#[no_mangle]
pub unsafe extern "C" fn BridgeHelperPoll(pid: i32, out_value: *mut i32) -> i32 {
    let (status, value) = match supervisor::poll_exit(pid) {
        Ok(None) => (BRIDGE_HELPER_RUNNING, 0),
        Ok(Some(HelperExit::Exited(code))) => (BRIDGE_HELPER_EXITED, code),
        Ok(Some(HelperExit::Signaled(signal))) => (BRIDGE_HELPER_SIGNALED, signal),
        Err(error) => {
            logger::warn(format!("BridgeHelperPoll(pid={pid}): {error}"));
            return BRIDGE_ERR_INVALID_ARGUMENT;
        }
    };
    if let Some(out) = unsafe { out_value.as_mut() } {
        *out = value;
    }
    status
}

/// Frees a string returned by `BridgeGetTraffic` or `BridgeGetTotalTraffic`.
#[no_mangle]
pub unsafe extern "C" fn BridgeStringFree(value: *mut c_char) {
    unsafe { ffi::free_owned_string(value) };
}

#[no_mangle]
pub unsafe extern "C" fn BridgeGetCounters(out: *mut BridgeCounters) -> bool {
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    let Some(bridge) = ready(&BRIDGE) else {
        return false;
    };
    *out = bridge.counters();
    true
}

#[no_mangle]
pub unsafe extern "C" fn BridgeSetLogSink(
    sink: *const BridgeLogSink,
    level: *const c_char,
    _error: *mut *mut c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = unsafe { ffi::borrow_str(level) };
    logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn BridgeSetBreadcrumbMask(mask: u32) {
    logger::set_breadcrumb_mask(mask);
    logger::breadcrumb(BreadcrumbFlags::FFI, format!("breadcrumb mask set to {mask:#x}"));
}

#[cfg(test)]
mod tests;
