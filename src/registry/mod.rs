//! Lifetime-tracked table of host callback objects.
//!
//! Registering pins the host reference and yields an owned [`Handle`]. The
//! handle is either released by the Rust owner (consuming it) or converted into
//! a raw [`HandleId`] and handed to the engine, which releases it later through
//! [`HandleRegistry::release_raw`]. Ids are never reused, so a stale id can
//! always be told apart from a live one.

use crate::attach::{with_host_thread, DetachPolicy};
use crate::counters::{Counter, Counters};
use crate::host::{HostObject, HostRuntime};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Wire form of a handle. `0` is the null handle.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub const NULL: HandleId = HandleId(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    /// Tunnel interface: protect and resolve_process.
    Tun,
    /// Invoke-action callback: exactly one result.
    Invoke,
    /// Event listener: repeatable notifications.
    Listener,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("null handle")]
    Null,
    #[error("handle {0} was released or never registered")]
    Released(HandleId),
    #[error("host refused to pin the callback object")]
    PinFailed,
    #[error("handle capacity of {0} reached")]
    CapacityExceeded(usize),
    #[error("handle {0} is a {1:?} handle")]
    WrongKind(HandleId, HandleKind),
    #[error("handle ids no longer fit a pointer")]
    IdSpaceExhausted,
}

/// Ids cross the engine boundary as pointer-sized values, so they stay below
/// `usize::MAX` on every target.
const ID_LIMIT: u64 = usize::MAX as u64;

/// A pinned host object. The host reference is unpinned when the last clone
/// drops, so a callback that looked the object up keeps it alive even if the
/// handle is released mid-call.
pub struct PinnedObject {
    object: HostObject,
    kind: HandleKind,
    delivered: AtomicBool,
    host: Arc<dyn HostRuntime>,
    policy: DetachPolicy,
    counters: Arc<Counters>,
}

impl PinnedObject {
    pub fn object(&self) -> HostObject {
        self.object
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Returns true exactly once over the lifetime of the object.
    pub(crate) fn claim_delivery(&self) -> bool {
        !self.delivered.swap(true, Ordering::AcqRel)
    }
}

impl Drop for PinnedObject {
    fn drop(&mut self) {
        let host = Arc::clone(&self.host);
        let object = self.object;
        if let Err(error) = with_host_thread(&*host, self.policy, || host.unpin(object)) {
            self.counters.bump(Counter::AttachFailures);
            logger::rate_limited_error(
                ErrorCategory::AttachFailure,
                format!("leaking host reference {:p}: {error}", object.as_ptr()),
            );
        }
    }
}

/// Owned registration. Not `Clone`: releasing consumes it, so a handle can be
/// released at most once.
#[must_use = "a registered handle must be released or transferred with `into_raw`"]
#[derive(Debug)]
pub struct Handle {
    id: HandleId,
    kind: HandleKind,
}

impl Handle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Transfers ownership across the boundary. Whoever receives the id must
    /// give it back through [`HandleRegistry::release_raw`].
    pub fn into_raw(self) -> HandleId {
        self.id
    }
}

pub struct HandleRegistry {
    table: Mutex<FxHashMap<HandleId, Arc<PinnedObject>>>,
    next_id: AtomicU64,
    capacity: usize,
    host: Arc<dyn HostRuntime>,
    policy: DetachPolicy,
    counters: Arc<Counters>,
}

impl HandleRegistry {
    /// `capacity == 0` disables the outstanding-handle limit.
    pub fn new(
        host: Arc<dyn HostRuntime>,
        policy: DetachPolicy,
        capacity: usize,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            table: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            capacity,
            host,
            policy,
            counters,
        }
    }

    pub fn register(&self, object: HostObject, kind: HandleKind) -> Result<Handle, HandleError> {
        if self.at_capacity(self.table.lock().len()) {
            return Err(HandleError::CapacityExceeded(self.capacity));
        }

        // Pin outside the table lock; the host call may be slow.
        let pinned = with_host_thread(&*self.host, self.policy, || self.host.pin(object))
            .map_err(|error| {
                self.counters.bump(Counter::AttachFailures);
                logger::warn(format!("register: {error}"));
                HandleError::PinFailed
            })?
            .ok_or(HandleError::PinFailed)?;

        let entry = Arc::new(PinnedObject {
            object: pinned,
            kind,
            delivered: AtomicBool::new(false),
            host: Arc::clone(&self.host),
            policy: self.policy,
            counters: Arc::clone(&self.counters),
        });

        let inserted = {
            let mut table = self.table.lock();
            if self.at_capacity(table.len()) {
                Err((entry, HandleError::CapacityExceeded(self.capacity)))
            } else {
                match self.next_id() {
                    Some(id) => {
                        table.insert(id, entry);
                        Ok(id)
                    }
                    None => Err((entry, HandleError::IdSpaceExhausted)),
                }
            }
        };
        let id = match inserted {
            Ok(id) => id,
            Err((entry, error)) => {
                // Lost a race for the last slot or ran out of ids; dropping
                // the entry unpins.
                drop(entry);
                return Err(error);
            }
        };

        self.counters.bump(Counter::HandlesRegistered);
        logger::breadcrumb(
            BreadcrumbFlags::HANDLE,
            format!("registered {kind:?} handle {id}"),
        );
        Ok(Handle { id, kind })
    }

    pub fn get(&self, id: HandleId) -> Result<Arc<PinnedObject>, HandleError> {
        if id.is_null() {
            return Err(HandleError::Null);
        }
        let entry = self.table.lock().get(&id).cloned();
        entry.ok_or_else(|| {
            self.counters.bump(Counter::StaleLookups);
            HandleError::Released(id)
        })
    }

    pub fn release(&self, handle: Handle) {
        let id = handle.id;
        if !self.remove(id) {
            // Owned handles are only removed here, so this means the id was
            // also handed out raw and released through that path.
            logger::warn(format!("release: handle {id} was already released raw"));
        }
    }

    /// Releases an id that crossed the boundary. A second release of the same
    /// id is a counted no-op.
    pub fn release_raw(&self, id: HandleId) -> bool {
        if id.is_null() {
            return false;
        }
        self.remove(id)
    }

    /// Releases an id the engine may already have released on its own, as it
    /// does for a replaced event listener. A miss is expected and not counted.
    pub fn release_if_present(&self, id: HandleId) -> bool {
        if id.is_null() {
            return false;
        }
        let released = self.take(id);
        if !released {
            logger::breadcrumb(
                BreadcrumbFlags::HANDLE,
                format!("handle {id} was already released by the engine"),
            );
        }
        released
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.table.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn at_capacity(&self, len: usize) -> bool {
        self.capacity != 0 && len >= self.capacity
    }

    fn next_id(&self) -> Option<HandleId> {
        self.next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next < ID_LIMIT).then(|| next + 1)
            })
            .ok()
            .map(HandleId)
    }

    fn remove(&self, id: HandleId) -> bool {
        if self.take(id) {
            return true;
        }
        self.counters.bump(Counter::DuplicateReleases);
        logger::rate_limited_error(
            ErrorCategory::DuplicateRelease,
            format!("ignoring release of unknown handle {id}"),
        );
        false
    }

    fn take(&self, id: HandleId) -> bool {
        // The table guard is a temporary, so the entry (and the host unpin in
        // its Drop) is released after the lock.
        let Some(entry) = self.table.lock().remove(&id) else {
            return false;
        };
        self.counters.bump(Counter::HandlesReleased);
        logger::breadcrumb(
            BreadcrumbFlags::HANDLE,
            format!("released {:?} handle {id}", entry.kind()),
        );
        drop(entry);
        true
    }

    #[cfg(test)]
    pub(crate) fn starting_at(self, first_id: u64) -> Self {
        self.next_id.store(first_id, Ordering::Relaxed);
        self
    }
}

#[cfg(test)]
mod tests;
