//! Binding to the libclash C archive.
//!
//! libclash takes ownership of every `char *` argument (it frees them after
//! copying), so arguments are duplicated with the C allocator. Strings it
//! returns are C-allocated as well and go back through `free`. Its callbacks
//! are process-wide function pointers without a context argument, which is why
//! the installed table lives in a static.

use super::TunnelEngine;
use crate::ffi::{self, EngineCallbacks};
use crate::logger::{self, BreadcrumbFlags};
use crate::registry::HandleId;
use once_cell::sync::OnceCell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;

type ProtectFunc = unsafe extern "C" fn(tun_interface: *mut c_void, fd: c_int);
type ResolveProcessFunc = unsafe extern "C" fn(
    tun_interface: *mut c_void,
    protocol: c_int,
    source: *const c_char,
    target: *const c_char,
    uid: c_int,
) -> *mut c_char;
type ResultFunc = unsafe extern "C" fn(invoke_interface: *mut c_void, data: *const c_char);
type ReleaseObjectFunc = unsafe extern "C" fn(object: *mut c_void);
type FreeStringFunc = unsafe extern "C" fn(data: *mut c_char);

extern "C" {
    fn startTUN(
        callback: *mut c_void,
        fd: c_int,
        stack: *mut c_char,
        address: *mut c_char,
        dns: *mut c_char,
    ) -> u8;
    fn stopTun();
    fn forceGC();
    fn updateDns(dns: *mut c_char);
    fn invokeAction(callback: *mut c_void, params: *mut c_char);
    fn setEventListener(listener: *mut c_void);
    fn getTraffic(only_statistics_proxy: u8) -> *mut c_char;
    fn getTotalTraffic(only_statistics_proxy: u8) -> *mut c_char;
    fn suspend(suspended: u8);

    static mut protect_func: Option<ProtectFunc>;
    static mut resolve_process_func: Option<ResolveProcessFunc>;
    static mut result_func: Option<ResultFunc>;
    static mut release_object_func: Option<ReleaseObjectFunc>;
    static mut free_string_func: Option<FreeStringFunc>;
}

static CALLBACKS: OnceCell<EngineCallbacks> = OnceCell::new();

/// The registry never issues an id wider than a pointer; anything else goes
/// out as the null handle.
fn handle_to_ptr(handle: HandleId) -> *mut c_void {
    usize::try_from(handle.as_raw()).unwrap_or(0) as *mut c_void
}

fn ptr_to_handle(object: *mut c_void) -> u64 {
    object as usize as u64
}

/// Duplicates `value` with the C allocator; libclash frees it.
fn c_dup(value: &CStr) -> *mut c_char {
    unsafe { libc::strdup(value.as_ptr()) }
}

/// Copies a libclash-owned string and frees the original.
fn take_c_string(raw: *mut c_char) -> String {
    if raw.is_null() {
        return String::new();
    }
    let copied = unsafe { CStr::from_ptr(raw) }
        .to_string_lossy()
        .into_owned();
    unsafe { libc::free(raw.cast::<c_void>()) };
    copied
}

unsafe extern "C" fn protect_shim(tun_interface: *mut c_void, fd: c_int) {
    if let Some(callbacks) = CALLBACKS.get() {
        unsafe { (callbacks.protect)(ptr_to_handle(tun_interface), fd, callbacks.context) };
    }
}

unsafe extern "C" fn resolve_process_shim(
    tun_interface: *mut c_void,
    protocol: c_int,
    source: *const c_char,
    target: *const c_char,
    uid: c_int,
) -> *mut c_char {
    match CALLBACKS.get() {
        Some(callbacks) => unsafe {
            (callbacks.resolve_process)(
                ptr_to_handle(tun_interface),
                protocol,
                source,
                target,
                uid,
                callbacks.context,
            )
        },
        None => ffi::into_owned_string(String::new()),
    }
}

unsafe extern "C" fn result_shim(invoke_interface: *mut c_void, data: *const c_char) {
    if let Some(callbacks) = CALLBACKS.get() {
        unsafe { (callbacks.on_result)(ptr_to_handle(invoke_interface), data, callbacks.context) };
    }
}

unsafe extern "C" fn release_object_shim(object: *mut c_void) {
    if let Some(callbacks) = CALLBACKS.get() {
        unsafe { (callbacks.release_object)(ptr_to_handle(object), callbacks.context) };
    }
}

unsafe extern "C" fn free_string_shim(data: *mut c_char) {
    match CALLBACKS.get() {
        Some(callbacks) => unsafe { (callbacks.free_string)(data, callbacks.context) },
        None => unsafe { ffi::free_owned_string(data) },
    }
}

/// The engine compiled into the process from libclash.
pub struct LinkedEngine {
    _private: (),
}

impl LinkedEngine {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for LinkedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelEngine for LinkedEngine {
    fn install_callbacks(&self, callbacks: EngineCallbacks) {
        if CALLBACKS.set(callbacks).is_err() {
            logger::warn("libclash callbacks already installed; keeping the first table");
            return;
        }
        unsafe {
            ptr::addr_of_mut!(protect_func).write(Some(protect_shim));
            ptr::addr_of_mut!(resolve_process_func).write(Some(resolve_process_shim));
            ptr::addr_of_mut!(result_func).write(Some(result_shim));
            ptr::addr_of_mut!(release_object_func).write(Some(release_object_shim));
            ptr::addr_of_mut!(free_string_func).write(Some(free_string_shim));
        }
        logger::breadcrumb(BreadcrumbFlags::ENGINE, "libclash callbacks installed");
    }

    fn start_tun(&self, callback: HandleId, fd: i32, stack: &CStr, address: &CStr, dns: &CStr) {
        let started = unsafe {
            startTUN(
                handle_to_ptr(callback),
                fd,
                c_dup(stack),
                c_dup(address),
                c_dup(dns),
            )
        };
        logger::breadcrumb(
            BreadcrumbFlags::ENGINE,
            format!("startTUN(fd={fd}, handle={callback}) -> {started}"),
        );
    }

    fn stop_tun(&self) {
        unsafe { stopTun() };
    }

    fn update_dns(&self, dns: &CStr) {
        unsafe { updateDns(c_dup(dns)) };
    }

    fn force_gc(&self) {
        unsafe { forceGC() };
    }

    fn invoke_action(&self, callback: HandleId, data: &CStr) {
        unsafe { invokeAction(handle_to_ptr(callback), c_dup(data)) };
    }

    fn set_event_listener(&self, listener: HandleId) {
        let raw = if listener.is_null() {
            ptr::null_mut()
        } else {
            handle_to_ptr(listener)
        };
        unsafe { setEventListener(raw) };
    }

    fn get_traffic(&self, only_proxies: bool) -> String {
        take_c_string(unsafe { getTraffic(u8::from(only_proxies)) })
    }

    fn get_total_traffic(&self, only_proxies: bool) -> String {
        take_c_string(unsafe { getTotalTraffic(u8::from(only_proxies)) })
    }

    fn suspend(&self, suspended: bool) {
        unsafe { suspend(u8::from(suspended)) };
    }
}
