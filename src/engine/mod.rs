//! The proxy engine as seen from the bridge.
//!
//! The engine owns every [`HandleId`] it receives until it hands it back
//! through `EngineCallbacks::release_object`.

#[cfg(feature = "libclash")]
mod linked;

#[cfg(feature = "libclash")]
pub use linked::LinkedEngine;

use crate::ffi::EngineCallbacks;
use crate::logger::{self, BreadcrumbFlags};
use crate::registry::HandleId;
use std::ffi::{c_char, CStr};

pub trait TunnelEngine: Send + Sync {
    /// Called once, before any other method.
    fn install_callbacks(&self, callbacks: EngineCallbacks);

    fn start_tun(&self, callback: HandleId, fd: i32, stack: &CStr, address: &CStr, dns: &CStr);

    fn stop_tun(&self);

    fn update_dns(&self, dns: &CStr);

    fn force_gc(&self);

    /// Exactly one result is delivered against `callback`.
    fn invoke_action(&self, callback: HandleId, data: &CStr);

    /// [`HandleId::NULL`] clears the listener.
    fn set_event_listener(&self, listener: HandleId);

    fn get_traffic(&self, only_proxies: bool) -> String;

    fn get_total_traffic(&self, only_proxies: bool) -> String;

    fn suspend(&self, suspended: bool);
}

/// Stand-in used when the library is built without an engine linked in.
/// Calls are accepted and ignored. Invoke callbacks still get their single
/// (empty) result, and every handle is released straight away.
#[derive(Default)]
pub struct NullEngine {
    callbacks: once_cell::sync::OnceCell<EngineCallbacks>,
}

impl NullEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn discard(&self, handle: HandleId, operation: &str) {
        logger::breadcrumb(
            BreadcrumbFlags::ENGINE,
            format!("{operation}: no engine linked, releasing {handle}"),
        );
        if let Some(callbacks) = self.callbacks.get() {
            unsafe { (callbacks.release_object)(handle.as_raw(), callbacks.context) };
        }
    }
}

impl TunnelEngine for NullEngine {
    fn install_callbacks(&self, callbacks: EngineCallbacks) {
        let _ = self.callbacks.set(callbacks);
    }

    fn start_tun(&self, callback: HandleId, _fd: i32, _stack: &CStr, _address: &CStr, _dns: &CStr) {
        self.discard(callback, "start_tun");
    }

    fn stop_tun(&self) {}

    fn update_dns(&self, _dns: &CStr) {}

    fn force_gc(&self) {}

    fn invoke_action(&self, callback: HandleId, _data: &CStr) {
        if let Some(callbacks) = self.callbacks.get() {
            let empty = b"\0".as_ptr().cast::<c_char>();
            unsafe { (callbacks.on_result)(callback.as_raw(), empty, callbacks.context) };
        }
        self.discard(callback, "invoke_action");
    }

    fn set_event_listener(&self, _listener: HandleId) {
        // The bridge releases the superseded listener itself.
    }

    fn get_traffic(&self, _only_proxies: bool) -> String {
        String::new()
    }

    fn get_total_traffic(&self, _only_proxies: bool) -> String {
        String::new()
    }

    fn suspend(&self, _suspended: bool) {}
}
