use super::*;
use crate::test_support::FakeHost;
use std::sync::atomic::Ordering;
use std::thread;

#[test]
fn keep_attached_leaves_worker_attached() {
    let host = FakeHost::new();
    let worker_host = host.clone();
    thread::spawn(move || {
        let value = with_host_thread(&*worker_host, DetachPolicy::KeepAttached, || {
            assert!(worker_host.is_attached());
            7
        })
        .unwrap();
        assert_eq!(value, 7);
        assert!(worker_host.is_attached());

        // Second call reuses the attachment.
        with_host_thread(&*worker_host, DetachPolicy::KeepAttached, || ()).unwrap();
    })
    .join()
    .unwrap();
    assert_eq!(host.attaches.load(Ordering::SeqCst), 1);
    assert_eq!(host.detaches.load(Ordering::SeqCst), 0);
}

#[test]
fn attachment_follows_the_host_not_a_cached_flag() {
    let host = FakeHost::new();
    let worker_host = host.clone();
    thread::spawn(move || {
        with_host_thread(&*worker_host, DetachPolicy::KeepAttached, || ()).unwrap();
        // The host drops the attachment behind the bridge's back.
        worker_host.detach_current_thread();
        with_host_thread(&*worker_host, DetachPolicy::KeepAttached, || {
            assert!(worker_host.is_attached());
        })
        .unwrap();
    })
    .join()
    .unwrap();
    assert_eq!(host.attaches.load(Ordering::SeqCst), 2);
    assert_eq!(host.detaches.load(Ordering::SeqCst), 1);
}

#[test]
fn detach_on_exit_detaches_what_it_attached() {
    let host = FakeHost::new();
    let worker_host = host.clone();
    thread::spawn(move || {
        with_host_thread(&*worker_host, DetachPolicy::DetachOnExit, || {
            assert!(worker_host.is_attached());
        })
        .unwrap();
        assert!(!worker_host.is_attached());
    })
    .join()
    .unwrap();
    assert_eq!(host.attaches.load(Ordering::SeqCst), 1);
    assert_eq!(host.detaches.load(Ordering::SeqCst), 1);
}

#[test]
fn nested_guard_does_not_detach_outer_attachment() {
    let host = FakeHost::new();
    let outer = AttachGuard::acquire(&*host, DetachPolicy::DetachOnExit).unwrap();
    {
        let _inner = AttachGuard::acquire(&*host, DetachPolicy::DetachOnExit).unwrap();
    }
    assert!(host.is_attached());
    drop(outer);
    assert!(!host.is_attached());
}

#[test]
fn detach_runs_when_callback_panics() {
    let host = FakeHost::new();
    let worker_host = host.clone();
    let outcome = thread::spawn(move || {
        let _ = with_host_thread(&*worker_host, DetachPolicy::DetachOnExit, || {
            panic!("host callback blew up");
        });
    })
    .join();
    assert!(outcome.is_err());
    assert_eq!(host.detaches.load(Ordering::SeqCst), 1);
}

#[test]
fn refused_attach_skips_the_call() {
    let host = FakeHost::new();
    host.set_refuse_attach(true);
    let mut ran = false;
    let result = with_host_thread(&*host, DetachPolicy::KeepAttached, || ran = true);
    assert_eq!(result, Err(AttachError::Refused(-1)));
    assert!(!ran);
}

#[test]
fn policy_flag_mapping() {
    assert_eq!(DetachPolicy::from_flag(true), DetachPolicy::DetachOnExit);
    assert_eq!(DetachPolicy::from_flag(false), DetachPolicy::KeepAttached);
    assert_eq!(DetachPolicy::default(), DetachPolicy::KeepAttached);
}
