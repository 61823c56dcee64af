#![cfg(all(test, feature = "loom"))]

use crate::mutex::{LockState, TryAcquire};
use crate::signal::SignalState;
use crate::sync::{AtomicU32, Ordering, thread};
use loom::sync::Arc;

fn take(signal: &SignalState) {
    while !signal.try_take() {
        thread::yield_now();
    }
}

/// Two signals passing a turn back and forth: the payload written before a
/// `set` is always visible after the matching take.
#[test]
fn signal_turn_taking_publishes_payload() {
    loom::model(|| {
        let write_ready = Arc::new(SignalState::new(true));
        let read_ready = Arc::new(SignalState::new(false));
        let payload = Arc::new(AtomicU32::new(0));

        let writer = {
            let write_ready = write_ready.clone();
            let read_ready = read_ready.clone();
            let payload = payload.clone();
            thread::spawn(move || {
                for chunk in 1..=2u32 {
                    take(&write_ready);
                    payload.store(chunk, Ordering::Relaxed);
                    read_ready.set();
                }
            })
        };

        for expected in 1..=2u32 {
            take(&read_ready);
            assert_eq!(payload.load(Ordering::Relaxed), expected);
            write_ready.set();
        }
        writer.join().unwrap();
    });
}

#[test]
fn signal_is_consumed_once() {
    loom::model(|| {
        let signal = Arc::new(SignalState::new(false));
        let setter = {
            let signal = signal.clone();
            thread::spawn(move || signal.set())
        };
        let a = {
            let signal = signal.clone();
            thread::spawn(move || signal.try_take())
        };
        let b = signal.try_take();
        setter.join().unwrap();
        let a = a.join().unwrap();
        let leftover = signal.try_take();
        assert_eq!([a, b, leftover].iter().filter(|t| **t).count(), 1);
    });
}

#[test]
fn lock_excludes_live_owners() {
    loom::model(|| {
        let lock = Arc::new(LockState::new());
        let inside = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = [1u32, 2]
            .into_iter()
            .map(|pid| {
                let lock = lock.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    if lock.try_acquire(pid, |_| true).is_acquired() {
                        assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                        inside.fetch_sub(1, Ordering::Relaxed);
                        assert!(lock.release(pid));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.owner(), None);
    });
}

#[test]
fn abandoned_lock_has_single_successor() {
    loom::model(|| {
        let lock = Arc::new(LockState::new());
        assert_eq!(lock.try_acquire(99, |_| true), TryAcquire::Acquired);

        let handles: Vec<_> = [1u32, 2]
            .into_iter()
            .map(|pid| {
                let lock = lock.clone();
                thread::spawn(move || lock.try_acquire(pid, |owner| owner != 99))
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = outcomes.iter().filter(|o| o.is_acquired()).count();
        assert_eq!(winners, 1);
    });
}
