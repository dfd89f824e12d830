use super::*;
use crate::test_support::{object, FakeHost};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::thread;

fn make_registry(host: &Arc<FakeHost>, capacity: usize) -> (HandleRegistry, Arc<Counters>) {
    let counters = Arc::new(Counters::new());
    let registry = HandleRegistry::new(
        host.clone(),
        DetachPolicy::KeepAttached,
        capacity,
        Arc::clone(&counters),
    );
    (registry, counters)
}

#[test]
fn released_handle_is_not_usable() {
    let host = FakeHost::new();
    let (registry, counters) = make_registry(&host, 0);

    let handle = registry.register(object(0x100), HandleKind::Tun).unwrap();
    let id = handle.id();
    assert!(registry.get(id).is_ok());
    assert_eq!(host.live_pins(), 1);

    registry.release(handle);

    assert_eq!(registry.get(id).err(), Some(HandleError::Released(id)));
    assert_eq!(host.live_pins(), 0);
    assert_eq!(host.unpin_count(0x100), 1);
    assert_eq!(counters.get(Counter::StaleLookups), 1);
}

#[test]
fn raw_release_twice_is_a_counted_noop() {
    let host = FakeHost::new();
    let (registry, counters) = make_registry(&host, 0);

    let id = registry
        .register(object(0x200), HandleKind::Invoke)
        .unwrap()
        .into_raw();
    assert!(registry.release_raw(id));
    assert!(!registry.release_raw(id));

    assert_eq!(host.unpin_count(0x200), 1);
    assert_eq!(host.bad_unpins.load(Ordering::SeqCst), 0);
    assert_eq!(counters.get(Counter::HandlesReleased), 1);
    assert_eq!(counters.get(Counter::DuplicateReleases), 1);
}

#[test]
fn null_handle_is_rejected() {
    let host = FakeHost::new();
    let (registry, _) = make_registry(&host, 0);
    assert_eq!(registry.get(HandleId::NULL).err(), Some(HandleError::Null));
    assert!(!registry.release_raw(HandleId::NULL));
}

#[test]
fn ids_are_never_reused() {
    let host = FakeHost::new();
    let (registry, _) = make_registry(&host, 0);
    let mut seen = HashSet::new();
    for round in 0..32 {
        let handle = registry
            .register(object(0x1000 + round), HandleKind::Invoke)
            .unwrap();
        assert!(seen.insert(handle.id()));
        registry.release(handle);
    }
    assert!(registry.is_empty());
}

#[test]
fn ids_stop_before_they_outgrow_a_pointer() {
    let host = FakeHost::new();
    let (registry, counters) = make_registry(&host, 0);
    let registry = registry.starting_at(usize::MAX as u64 - 1);

    let last = registry.register(object(0x3000), HandleKind::Tun).unwrap();
    assert_eq!(last.id().as_raw(), usize::MAX as u64 - 1);
    assert_eq!(
        registry.register(object(0x3001), HandleKind::Tun).err(),
        Some(HandleError::IdSpaceExhausted)
    );

    // The refused object is unpinned and no id wrapped around to null.
    assert_eq!(host.unpin_count(0x3001), 1);
    assert_eq!(host.live_pins(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(counters.get(Counter::HandlesRegistered), 1);
    registry.release(last);
}

#[test]
fn quiet_release_skips_the_duplicate_count() {
    let host = FakeHost::new();
    let (registry, counters) = make_registry(&host, 0);

    let id = registry
        .register(object(0x400), HandleKind::Listener)
        .unwrap()
        .into_raw();
    assert!(registry.release_raw(id));
    assert!(!registry.release_if_present(id));
    assert!(!registry.release_if_present(HandleId::NULL));

    assert_eq!(host.unpin_count(0x400), 1);
    assert_eq!(counters.get(Counter::HandlesReleased), 1);
    assert_eq!(counters.get(Counter::DuplicateReleases), 0);
}

#[test]
fn in_flight_lookup_keeps_object_pinned() {
    let host = FakeHost::new();
    let (registry, _) = make_registry(&host, 0);

    let id = registry
        .register(object(0x300), HandleKind::Tun)
        .unwrap()
        .into_raw();
    let in_flight = registry.get(id).unwrap();
    assert!(registry.release_raw(id));

    // Released for new lookups, still pinned for the caller holding it.
    assert!(registry.get(id).is_err());
    assert_eq!(host.live_pins(), 1);
    drop(in_flight);
    assert_eq!(host.live_pins(), 0);
}

#[test]
fn capacity_limits_outstanding_handles() {
    let host = FakeHost::new();
    let (registry, _) = make_registry(&host, 2);

    let first = registry.register(object(0x10), HandleKind::Invoke).unwrap();
    let second = registry.register(object(0x20), HandleKind::Invoke).unwrap();
    assert_eq!(
        registry.register(object(0x30), HandleKind::Invoke).err(),
        Some(HandleError::CapacityExceeded(2))
    );
    assert_eq!(host.live_pins(), 2);

    registry.release(first);
    let third = registry.register(object(0x30), HandleKind::Invoke).unwrap();
    registry.release(second);
    registry.release(third);
    assert!(registry.is_empty());
}

#[test]
fn pin_failure_leaves_table_untouched() {
    let host = FakeHost::new();
    let (registry, counters) = make_registry(&host, 0);
    host.set_refuse_pin(true);
    assert_eq!(
        registry.register(object(0x400), HandleKind::Tun).err(),
        Some(HandleError::PinFailed)
    );
    host.set_refuse_attach(true);
    host.set_refuse_pin(false);
    assert_eq!(
        registry.register(object(0x400), HandleKind::Tun).err(),
        Some(HandleError::PinFailed)
    );
    assert!(registry.is_empty());
    assert_eq!(counters.get(Counter::HandlesRegistered), 0);
    assert_eq!(counters.get(Counter::AttachFailures), 1);
}

#[test]
fn concurrent_register_use_release_keeps_table_consistent() {
    let host = FakeHost::new();
    let (registry, counters) = make_registry(&host, 0);
    let registry = Arc::new(registry);

    let workers: Vec<_> = (0..10)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut kept = Vec::new();
                for round in 0..200 {
                    let target = object(0x1_0000 + worker * 1000 + round);
                    let handle = registry.register(target, HandleKind::Tun).unwrap();
                    assert_eq!(registry.get(handle.id()).unwrap().kind(), HandleKind::Tun);
                    if round % 2 == 0 {
                        registry.release(handle);
                    } else {
                        kept.push(handle.into_raw());
                    }
                }
                kept
            })
        })
        .collect();

    let mut kept = Vec::new();
    for worker in workers {
        kept.extend(worker.join().unwrap());
    }

    assert_eq!(registry.len(), 10 * 100);
    assert_eq!(kept.iter().collect::<HashSet<_>>().len(), kept.len());
    for id in &kept {
        assert!(registry.contains(*id));
    }
    for id in kept {
        assert!(registry.release_raw(id));
    }
    assert!(registry.is_empty());
    assert_eq!(host.live_pins(), 0);
    assert_eq!(counters.get(Counter::HandlesRegistered), 2000);
    assert_eq!(counters.get(Counter::HandlesReleased), 2000);
    assert_eq!(counters.get(Counter::DuplicateReleases), 0);
}
