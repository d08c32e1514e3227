//! KeyedRegistry: partition isolation and lazy creation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use eventlink_subscriptions::KeyedRegistry;

#[test]
fn receive_only_reaches_listeners_of_that_key() {
    let keyed: KeyedRegistry<&'static str, i32> = KeyedRegistry::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let a = Arc::clone(&seen);
    keyed.queue(&"A", move |v, _| a.lock().unwrap().push(("A", *v)));
    let b = Arc::clone(&seen);
    keyed.queue(&"B", move |v, _| b.lock().unwrap().push(("B", *v)));

    assert_eq!(keyed.receive(&"A", &1), 1);
    assert_eq!(keyed.receive(&"B", &2), 1);
    assert_eq!(*seen.lock().unwrap(), vec![("A", 1), ("B", 2)]);
}

#[test]
fn unknown_key_is_dropped_silently() {
    let keyed: KeyedRegistry<u32, i32> = KeyedRegistry::new();
    assert_eq!(keyed.receive(&42, &1), 0);
    assert!(!keyed.contains_key(&42));
}

#[test]
fn partitions_persist_after_last_listener_leaves() {
    let keyed: KeyedRegistry<u32, i32> = KeyedRegistry::new();
    let sub = keyed.queue(&1, |_, _| {});
    assert!(!keyed.is_empty());

    sub.cancel();
    assert!(keyed.is_empty());
    assert!(keyed.contains_key(&1));
    assert_eq!(keyed.receive(&1, &5), 0);
}

#[test]
fn is_empty_requires_every_partition_empty() {
    let keyed: KeyedRegistry<u32, i32> = KeyedRegistry::new();
    assert!(keyed.is_empty());

    let first = keyed.queue(&1, |_, _| {});
    let second = keyed.queue(&2, |_, _| {});
    first.cancel();
    assert!(!keyed.is_empty());
    second.cancel();
    assert!(keyed.is_empty());
}

#[test]
fn registry_lookup_returns_shared_partition() {
    let keyed: KeyedRegistry<u32, i32> = KeyedRegistry::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = Arc::clone(&hits);
    keyed.registry(&7).subscribe(move |_, _| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    keyed.receive(&7, &0);
    keyed.registry(&7).receive(&0);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn queue_with_teardown_runs_teardown_on_self_cancel() {
    let keyed: KeyedRegistry<u32, i32> = KeyedRegistry::new();
    let teardowns = Arc::new(AtomicUsize::new(0));

    let t = Arc::clone(&teardowns);
    keyed.queue_with_teardown(
        &3,
        |_, me| {
            me.cancel();
        },
        move || {
            t.fetch_add(1, Ordering::SeqCst);
        },
    );

    keyed.receive(&3, &1);
    keyed.receive(&3, &2);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn listener_for_one_key_may_queue_on_another_during_delivery() {
    let keyed: KeyedRegistry<u32, i32> = KeyedRegistry::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let inner = keyed.clone();
    let s = Arc::clone(&seen);
    keyed.queue(&1, move |_, me| {
        let s = Arc::clone(&s);
        inner.queue(&2, move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        me.cancel();
    });

    keyed.receive(&1, &0);
    keyed.receive(&2, &0);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_first_use_creates_one_partition() {
    let keyed: KeyedRegistry<u32, u32> = KeyedRegistry::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let keyed = keyed.clone();
            let hits = Arc::clone(&hits);
            std::thread::spawn(move || {
                keyed.queue(&99, move |_, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(keyed.receive(&99, &0), 8);
    assert_eq!(hits.load(Ordering::SeqCst), 8);
}
