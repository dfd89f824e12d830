//! Entry-point composition: every exported operation lands here.

use crate::attach::DetachPolicy;
use crate::counters::{Counter, Counters};
use crate::dispatch::{self, CallbackDispatcher};
use crate::engine::TunnelEngine;
use crate::ffi::{BridgeCounters, BridgeOptions};
use crate::host::{HostObject, HostRuntime};
use crate::logger::{self, BreadcrumbFlags};
use crate::registry::{HandleError, HandleId, HandleKind, HandleRegistry};
use crate::supervisor::{self, HelperConfig, HelperProcess, LaunchError};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Process-wide bridge state.
///
/// Field order is drop order: the engine goes first so nothing calls into the
/// dispatcher once it is gone.
pub struct Bridge {
    engine: Arc<dyn TunnelEngine>,
    /// Context of the callback table the engine holds.
    _dispatcher: Arc<CallbackDispatcher>,
    registry: Arc<HandleRegistry>,
    /// Listener the engine currently holds, released when superseded.
    listener: Mutex<Option<HandleId>>,
    counters: Arc<Counters>,
}

impl Bridge {
    pub fn new(
        host: Arc<dyn HostRuntime>,
        engine: Arc<dyn TunnelEngine>,
        options: BridgeOptions,
    ) -> Self {
        let policy = DetachPolicy::from_flag(options.detach_after_callback);
        let counters = Arc::new(Counters::new());
        let registry = Arc::new(HandleRegistry::new(
            Arc::clone(&host),
            policy,
            options.max_outstanding_handles as usize,
            Arc::clone(&counters),
        ));
        let dispatcher = Arc::new(CallbackDispatcher::new(
            Arc::clone(&registry),
            host,
            policy,
            Arc::clone(&counters),
        ));
        engine.install_callbacks(dispatch::engine_callbacks(&dispatcher));

        logger::breadcrumb(
            BreadcrumbFlags::FFI,
            format!(
                "bridge initialized (policy={policy:?}, max_handles={})",
                options.max_outstanding_handles
            ),
        );

        Self {
            engine,
            _dispatcher: dispatcher,
            registry,
            listener: Mutex::new(None),
            counters,
        }
    }

    /// Registers `callback` and hands its handle to the engine, which owns it
    /// from then on.
    pub fn start_tun(
        &self,
        fd: i32,
        callback: HostObject,
        stack: &CStr,
        address: &CStr,
        dns: &CStr,
    ) -> Result<HandleId, HandleError> {
        let handle = self.registry.register(callback, HandleKind::Tun)?.into_raw();
        logger::info(format!(
            "start_tun fd={fd} stack={} address={} handle={handle}",
            stack.to_string_lossy(),
            address.to_string_lossy()
        ));
        self.engine.start_tun(handle, fd, stack, address, dns);
        Ok(handle)
    }

    /// Stops the engine. Handles the session received stay registered until
    /// the engine releases them.
    pub fn stop_tun(&self) {
        logger::info("stop_tun");
        self.engine.stop_tun();
    }

    pub fn update_dns(&self, dns: &CStr) {
        logger::breadcrumb(
            BreadcrumbFlags::ENGINE,
            format!("update_dns {}", dns.to_string_lossy()),
        );
        self.engine.update_dns(dns);
    }

    pub fn force_gc(&self) {
        self.engine.force_gc();
    }

    /// Registers a fresh one-shot handle for this call. The result arrives
    /// asynchronously through the dispatcher.
    pub fn invoke_action(&self, data: &CStr, callback: HostObject) -> Result<HandleId, HandleError> {
        let handle = self
            .registry
            .register(callback, HandleKind::Invoke)?
            .into_raw();
        logger::breadcrumb(BreadcrumbFlags::ENGINE, format!("invoke_action -> {handle}"));
        self.engine.invoke_action(handle, data);
        Ok(handle)
    }

    /// Installs `callback` as the event listener, or clears it with `None`.
    /// Exactly the previous listener is released, after the engine switched.
    /// An engine that already released it on its own is not an error.
    pub fn set_event_listener(
        &self,
        callback: Option<HostObject>,
    ) -> Result<HandleId, HandleError> {
        // Held across the engine call so concurrent replacements each release
        // their own predecessor.
        let mut current = self.listener.lock();
        let next = match callback {
            Some(object) => self
                .registry
                .register(object, HandleKind::Listener)?
                .into_raw(),
            None => HandleId::NULL,
        };
        self.engine.set_event_listener(next);
        let previous = std::mem::replace(&mut *current, (!next.is_null()).then_some(next));
        drop(current);

        if let Some(previous) = previous {
            self.registry.release_if_present(previous);
        }
        logger::breadcrumb(
            BreadcrumbFlags::HANDLE,
            format!("event listener {previous:?} -> {next}"),
        );
        Ok(next)
    }

    pub fn get_traffic(&self, only_proxies: bool) -> String {
        self.engine.get_traffic(only_proxies)
    }

    pub fn get_total_traffic(&self, only_proxies: bool) -> String {
        self.engine.get_total_traffic(only_proxies)
    }

    pub fn suspend(&self, suspended: bool) {
        logger::info(format!("suspend({suspended})"));
        self.engine.suspend(suspended);
    }

    pub fn start_helper_process(&self, config: &HelperConfig) -> Result<HelperProcess, LaunchError> {
        let helper = supervisor::launch(config)?;
        self.counters.bump(Counter::HelpersLaunched);
        Ok(helper)
    }

    pub fn counters(&self) -> BridgeCounters {
        self.counters.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }
}
