//! Native → host callback shapes.
//!
//! * Notify: `protect`, listener events. Fire-and-forget.
//! * Query: `resolve_process`. Blocks the engine thread on the host call; no
//!   timeout is enforced, the host must answer promptly.
//! * One-shot result: `deliver_result` on an invoke handle. Accepted once.
//!
//! Every host call runs on an attached thread and outside the registry lock.

use crate::attach::{with_host_thread, AttachError, DetachPolicy};
use crate::counters::{Counter, Counters};
use crate::ffi::{self, EngineCallbacks};
use crate::host::HostRuntime;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::registry::{HandleError, HandleId, HandleKind, HandleRegistry, PinnedObject};
use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error("result already delivered for handle {0}")]
    AlreadyDelivered(HandleId),
    #[error("host returned no usable answer")]
    NoAnswer,
}

pub struct CallbackDispatcher {
    registry: Arc<HandleRegistry>,
    host: Arc<dyn HostRuntime>,
    policy: DetachPolicy,
    counters: Arc<Counters>,
}

impl CallbackDispatcher {
    pub fn new(
        registry: Arc<HandleRegistry>,
        host: Arc<dyn HostRuntime>,
        policy: DetachPolicy,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            registry,
            host,
            policy,
            counters,
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Asks the host to exclude `fd` from the tunnel. The null handle is
    /// accepted and ignored.
    pub fn protect(&self, id: HandleId, fd: i32) -> Result<(), DispatchError> {
        if id.is_null() {
            return Ok(());
        }
        let result = self.lookup(id, &[HandleKind::Tun]).and_then(|pinned| {
            self.on_host_thread(|| self.host.protect(pinned.object(), fd))
        });
        self.settle("protect", id, result)
    }

    /// Delivers an engine event to the current listener. A null listener
    /// swallows the event.
    pub fn notify_event(&self, id: HandleId, payload: &CStr) -> Result<(), DispatchError> {
        if id.is_null() {
            return Ok(());
        }
        let result = self.lookup(id, &[HandleKind::Listener]).and_then(|pinned| {
            self.on_host_thread(|| self.host.on_result(pinned.object(), payload))
        });
        self.settle("event", id, result)
    }

    /// Owner lookup for a connection. Any failure answers with the empty
    /// string, the boundary has no other error channel.
    pub fn resolve_process(
        &self,
        id: HandleId,
        protocol: i32,
        source: &CStr,
        target: &CStr,
        uid: i32,
    ) -> String {
        let result = self.lookup(id, &[HandleKind::Tun]).and_then(|pinned| {
            self.on_host_thread(|| {
                self.host
                    .resolve_process(pinned.object(), protocol, source, target, uid)
            })?
            .ok_or(DispatchError::NoAnswer)
        });
        match result {
            Ok(owner) => {
                self.counters.bump(Counter::CallbacksDispatched);
                owner
            }
            Err(DispatchError::NoAnswer) => {
                // The host answered; it just has no owner for this flow.
                self.counters.bump(Counter::CallbacksDispatched);
                logger::rate_limited_error(
                    ErrorCategory::QueryFailure,
                    format!("resolve_process on {id}: host had no owner for uid {uid}"),
                );
                String::new()
            }
            Err(error) => {
                self.report_drop("resolve_process", id, &error);
                String::new()
            }
        }
    }

    /// Hands `data` to the callback behind `id`. Invoke handles accept exactly
    /// one result; listener handles treat it as a notification. The handle is
    /// not released here. A null id means no listener and is a no-op.
    pub fn deliver_result(&self, id: HandleId, data: &CStr) -> Result<(), DispatchError> {
        if id.is_null() {
            return Ok(());
        }
        let result = self
            .lookup(id, &[HandleKind::Invoke, HandleKind::Listener])
            .and_then(|pinned| {
                if pinned.kind() == HandleKind::Invoke && !pinned.claim_delivery() {
                    self.counters.bump(Counter::ResultsRejected);
                    logger::rate_limited_error(
                        ErrorCategory::DuplicateResult,
                        format!("dropping second result for handle {id}"),
                    );
                    return Err(DispatchError::AlreadyDelivered(id));
                }
                self.on_host_thread(|| self.host.on_result(pinned.object(), data))
            });
        self.settle("result", id, result)
    }

    pub fn release(&self, id: HandleId) -> bool {
        self.registry.release_raw(id)
    }

    fn lookup(
        &self,
        id: HandleId,
        accepted: &[HandleKind],
    ) -> Result<Arc<PinnedObject>, DispatchError> {
        let pinned = self.registry.get(id)?;
        if accepted.contains(&pinned.kind()) {
            Ok(pinned)
        } else {
            Err(HandleError::WrongKind(id, pinned.kind()).into())
        }
    }

    fn on_host_thread<R>(&self, f: impl FnOnce() -> R) -> Result<R, DispatchError> {
        with_host_thread(&*self.host, self.policy, f).map_err(|error| {
            self.counters.bump(Counter::AttachFailures);
            DispatchError::from(error)
        })
    }

    fn settle(
        &self,
        shape: &'static str,
        id: HandleId,
        result: Result<(), DispatchError>,
    ) -> Result<(), DispatchError> {
        match &result {
            Ok(()) => {
                self.counters.bump(Counter::CallbacksDispatched);
                logger::breadcrumb(BreadcrumbFlags::DISPATCH, format!("{shape} -> {id}"));
            }
            Err(error) => self.report_drop(shape, id, error),
        }
        result
    }

    fn report_drop(&self, shape: &'static str, id: HandleId, error: &DispatchError) {
        self.counters.bump(Counter::CallbacksDropped);
        let category = match error {
            DispatchError::Attach(_) => ErrorCategory::AttachFailure,
            DispatchError::AlreadyDelivered(_) => ErrorCategory::DuplicateResult,
            _ => ErrorCategory::StaleHandle,
        };
        logger::rate_limited_error(category, format!("dropped {shape} for {id}: {error}"));
    }
}

/// Builds the callback table handed to the engine. The table borrows
/// `dispatcher`; the engine must stop calling it before the dispatcher drops.
pub fn engine_callbacks(dispatcher: &Arc<CallbackDispatcher>) -> EngineCallbacks {
    EngineCallbacks {
        protect: engine_protect,
        resolve_process: engine_resolve_process,
        on_result: engine_on_result,
        release_object: engine_release_object,
        free_string: engine_free_string,
        context: Arc::as_ptr(dispatcher) as *mut c_void,
    }
}

/// # Safety
/// `context` must come from [`engine_callbacks`] with the dispatcher still alive.
unsafe fn dispatcher_from<'a>(context: *mut c_void) -> Option<&'a CallbackDispatcher> {
    unsafe { (context as *const CallbackDispatcher).as_ref() }
}

unsafe extern "C" fn engine_protect(handle: u64, fd: i32, context: *mut c_void) {
    if let Some(dispatcher) = unsafe { dispatcher_from(context) } {
        let _ = dispatcher.protect(HandleId::from_raw(handle), fd);
    }
}

unsafe extern "C" fn engine_resolve_process(
    handle: u64,
    protocol: i32,
    source: *const c_char,
    target: *const c_char,
    uid: i32,
    context: *mut c_void,
) -> *mut c_char {
    let owner = match unsafe { dispatcher_from(context) } {
        Some(dispatcher) => {
            let source = unsafe { ffi::borrow_c_str(source) }.unwrap_or_default();
            let target = unsafe { ffi::borrow_c_str(target) }.unwrap_or_default();
            dispatcher.resolve_process(HandleId::from_raw(handle), protocol, source, target, uid)
        }
        None => String::new(),
    };
    ffi::into_owned_string(owner)
}

unsafe extern "C" fn engine_on_result(handle: u64, data: *const c_char, context: *mut c_void) {
    let Some(dispatcher) = (unsafe { dispatcher_from(context) }) else {
        return;
    };
    let data = unsafe { ffi::borrow_c_str(data) }.unwrap_or_default();
    let _ = dispatcher.deliver_result(HandleId::from_raw(handle), data);
}

unsafe extern "C" fn engine_release_object(handle: u64, context: *mut c_void) {
    if let Some(dispatcher) = unsafe { dispatcher_from(context) } {
        dispatcher.release(HandleId::from_raw(handle));
    }
}

unsafe extern "C" fn engine_free_string(value: *mut c_char, _context: *mut c_void) {
    unsafe { ffi::free_owned_string(value) };
}
