//! In-process host runtime used by the unit tests.

use crate::attach::{AttachError, AttachState};
use crate::host::{HostObject, HostRuntime};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::ffi::{c_void, CStr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

const PIN_BASE: usize = 0x1000_0000;

pub(crate) fn object(value: usize) -> HostObject {
    HostObject::from_raw(value as *mut c_void).expect("test objects are non-null")
}

#[derive(Default)]
pub(crate) struct FakeHost {
    attached: Mutex<FxHashSet<ThreadId>>,
    refuse_attach: AtomicBool,
    refuse_pin: AtomicBool,
    pub attaches: AtomicUsize,
    pub detaches: AtomicUsize,
    next_pin: AtomicUsize,
    /// pinned reference -> original call-local reference
    pins: Mutex<FxHashMap<usize, usize>>,
    pub unpinned: Mutex<Vec<usize>>,
    /// Unpins of references that were not pinned (double free on the host side).
    pub bad_unpins: AtomicUsize,
    /// Calls made from threads that were not attached.
    pub unattached_calls: AtomicUsize,
    /// Calls made against references that were not pinned (use after free).
    pub stale_calls: AtomicUsize,
    pub protects: Mutex<Vec<(usize, i32)>>,
    pub results: Mutex<Vec<(usize, String)>>,
    pub resolves: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_refuse_attach(&self, refuse: bool) {
        self.refuse_attach.store(refuse, Ordering::SeqCst);
    }

    pub fn set_refuse_pin(&self, refuse: bool) {
        self.refuse_pin.store(refuse, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.lock().contains(&thread::current().id())
    }

    pub fn live_pins(&self) -> usize {
        self.pins.lock().len()
    }

    pub fn results_for(&self, original: usize) -> Vec<String> {
        self.results
            .lock()
            .iter()
            .filter(|(target, _)| *target == original)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn unpin_count(&self, original: usize) -> usize {
        self.unpinned
            .lock()
            .iter()
            .filter(|value| **value == original)
            .count()
    }

    /// Resolves a pinned reference back to the object the test registered.
    fn checked_target(&self, target: HostObject) -> usize {
        if !self.is_attached() {
            self.unattached_calls.fetch_add(1, Ordering::SeqCst);
        }
        match self.pins.lock().get(&(target.as_ptr() as usize)) {
            Some(original) => *original,
            None => {
                self.stale_calls.fetch_add(1, Ordering::SeqCst);
                0
            }
        }
    }
}

impl HostRuntime for FakeHost {
    fn attach_current_thread(&self) -> Result<AttachState, AttachError> {
        if self.refuse_attach.load(Ordering::SeqCst) {
            return Err(AttachError::Refused(-1));
        }
        if self.attached.lock().insert(thread::current().id()) {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            Ok(AttachState::NewlyAttached)
        } else {
            Ok(AttachState::Attached)
        }
    }

    fn detach_current_thread(&self) {
        if self.attached.lock().remove(&thread::current().id()) {
            self.detaches.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pin(&self, object: HostObject) -> Option<HostObject> {
        if self.refuse_pin.load(Ordering::SeqCst) {
            return None;
        }
        let slot = self.next_pin.fetch_add(1, Ordering::SeqCst);
        let pinned = PIN_BASE + slot * 16;
        self.pins.lock().insert(pinned, object.as_ptr() as usize);
        HostObject::from_raw(pinned as *mut c_void)
    }

    fn unpin(&self, object: HostObject) {
        match self.pins.lock().remove(&(object.as_ptr() as usize)) {
            Some(original) => self.unpinned.lock().push(original),
            None => {
                self.bad_unpins.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn protect(&self, target: HostObject, fd: i32) {
        let original = self.checked_target(target);
        self.protects.lock().push((original, fd));
    }

    fn resolve_process(
        &self,
        target: HostObject,
        protocol: i32,
        source: &CStr,
        destination: &CStr,
        uid: i32,
    ) -> Option<String> {
        self.checked_target(target);
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if uid < 0 {
            return None;
        }
        Some(format!(
            "{protocol}:{}>{}:uid-{uid}",
            source.to_string_lossy(),
            destination.to_string_lossy()
        ))
    }

    fn on_result(&self, target: HostObject, data: &CStr) {
        let original = self.checked_target(target);
        self.results
            .lock()
            .push((original, data.to_string_lossy().into_owned()));
    }
}
