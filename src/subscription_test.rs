use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn emit_reaches_every_handler_in_order() {
    let set = HandlerSet::<u32>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let seen = Arc::clone(&seen);
        set.subscribe(move |v| seen.lock().unwrap().push(("a", *v)))
    };
    let b = {
        let seen = Arc::clone(&seen);
        set.subscribe(move |v| seen.lock().unwrap().push(("b", *v)))
    };

    assert_eq!(set.emit("test", &7), 2);
    assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    drop((a, b));
}

#[test]
fn dropping_subscription_removes_only_that_handler() {
    let set = HandlerSet::<()>::new();
    let count = Arc::new(AtomicUsize::new(0));

    let keep = {
        let count = Arc::clone(&count);
        set.subscribe(move |()| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    let gone = set.subscribe(|()| panic!("should have been removed"));
    drop(gone);

    assert_eq!(set.len(), 1);
    assert_eq!(set.emit("test", &()), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    keep.unsubscribe();
    assert!(set.is_empty());
}

#[test]
fn panicking_handler_does_not_block_others() {
    let set = HandlerSet::<u8>::new();
    let count = Arc::new(AtomicUsize::new(0));

    let _bad = set.subscribe(|_| panic!("boom"));
    let _good = {
        let count = Arc::clone(&count);
        set.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    assert_eq!(set.emit("test", &1), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn subscription_outliving_set_is_harmless() {
    let set = HandlerSet::<u8>::new();
    let sub = set.subscribe(|_| {});
    drop(set);
    sub.unsubscribe();
}

#[test]
fn detached_subscription_stays_registered() {
    let set = HandlerSet::<u8>::new();
    set.subscribe(|_| {}).detach();
    assert_eq!(set.len(), 1);
}

#[test]
fn handler_may_subscribe_during_emit() {
    let set = HandlerSet::<u8>::new();
    let inner_set = set.clone();
    let extra = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let extra = Arc::clone(&extra);
        set.subscribe(move |_| {
            extra.lock().unwrap().push(inner_set.subscribe(|_| {}));
        })
    };

    assert_eq!(set.emit("test", &0), 1);
    assert_eq!(set.len(), 2);
}
