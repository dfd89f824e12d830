use std::sync::atomic::{AtomicU64, Ordering};

use crate::ffi::BridgeCounters;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    HandlesRegistered,
    HandlesReleased,
    DuplicateReleases,
    StaleLookups,
    CallbacksDispatched,
    CallbacksDropped,
    AttachFailures,
    ResultsRejected,
    HelpersLaunched,
}

const COUNTER_SLOTS: usize = 9;

impl Counter {
    fn index(self) -> usize {
        match self {
            Self::HandlesRegistered => 0,
            Self::HandlesReleased => 1,
            Self::DuplicateReleases => 2,
            Self::StaleLookups => 3,
            Self::CallbacksDispatched => 4,
            Self::CallbacksDropped => 5,
            Self::AttachFailures => 6,
            Self::ResultsRejected => 7,
            Self::HelpersLaunched => 8,
        }
    }
}

/// Lock-free bridge counters, shared by the registry, dispatcher and entry points.
#[derive(Default)]
pub struct Counters {
    slots: [AtomicU64; COUNTER_SLOTS],
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, counter: Counter) {
        self.slots[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slots[counter.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BridgeCounters {
        BridgeCounters {
            handles_registered: self.get(Counter::HandlesRegistered),
            handles_released: self.get(Counter::HandlesReleased),
            duplicate_releases: self.get(Counter::DuplicateReleases),
            stale_lookups: self.get(Counter::StaleLookups),
            callbacks_dispatched: self.get(Counter::CallbacksDispatched),
            callbacks_dropped: self.get(Counter::CallbacksDropped),
            attach_failures: self.get(Counter::AttachFailures),
            results_rejected: self.get(Counter::ResultsRejected),
            helpers_launched: self.get(Counter::HelpersLaunched),
        }
    }
}
