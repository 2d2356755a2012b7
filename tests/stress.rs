//! Stress tests for the quantified invariants in the testable-properties
//! section: real threads, randomized sleeps, no model checker — in the
//! style of a `qrwlock_test_multy_threaded`-shaped test rather than
//! loom/proptest, since nothing in the reference pack pulls those in.

use rand::Rng;
use sixlock::SixLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WRITE_MARKER: usize = 1 << 31;

/// Invariant 1: at most one writer in its critical section at any instant.
#[test]
fn invariant1_writers_are_mutually_exclusive() {
    const WRITERS: usize = 6;
    const ITERS: usize = 200;

    let lock = Arc::new(SixLock::new(0usize));
    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let lock = lock.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..ITERS {
                    let mut w = lock.write();
                    assert_eq!(*w & WRITE_MARKER, 0, "another writer was already in the critical section");
                    *w |= WRITE_MARKER;
                    thread::sleep(Duration::from_micros(rng.gen_range(0..50)));
                    *w &= !WRITE_MARKER;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// Invariant 2: at most one intent holder at a time; read and intent
/// coexist freely.
#[test]
fn invariant2_intent_exclusive_read_coexists() {
    const TASKS: usize = 8;
    const ITERS: usize = 150;

    let lock = Arc::new(SixLock::new(()));
    let concurrent_intent = Arc::new(AtomicUsize::new(0));
    let max_concurrent_intent = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            let lock = lock.clone();
            let concurrent_intent = concurrent_intent.clone();
            let max_concurrent_intent = max_concurrent_intent.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..ITERS {
                    if i % 2 == 0 {
                        let _i = lock.intent();
                        let now = concurrent_intent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent_intent.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(rng.gen_range(0..30)));
                        concurrent_intent.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let _r = lock.read();
                        thread::sleep(Duration::from_micros(rng.gen_range(0..30)));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(max_concurrent_intent.load(Ordering::SeqCst), 1);
}

/// Invariant 3: a single task's own lock/unlock pairs never deadlock it.
#[test]
fn invariant3_single_task_ping_pong() {
    let lock = SixLock::new(0);
    for _ in 0..1000 {
        drop(lock.read());
        drop(lock.intent());
        drop(lock.write());
    }
}

/// Invariant 4: `seq` increases by exactly 2 per write critical section and
/// is never observed to go backwards.
#[test]
fn invariant4_seq_monotone_plus_two_per_write() {
    let lock = SixLock::new(());
    let mut last = lock.seq();
    for i in 1..=500u32 {
        let w = lock.write();
        drop(w);
        let now = lock.seq();
        assert!(now >= last);
        assert_eq!(now, 2 * i);
        last = now;
    }
}

/// Invariant 5: `relock` only succeeds when no writer has intervened.
#[test]
fn invariant5_relock_tracks_intervening_writers() {
    let lock = SixLock::new(());

    let r = lock.read();
    let s = lock.seq();
    drop(r);

    // No writer yet: relock must succeed and must not itself bump seq.
    let relocked = lock.relock_read(s).expect("no writer intervened yet");
    let s_after = lock.seq();
    drop(relocked);
    assert_eq!(s, s_after);

    drop(lock.write());
    assert!(lock.relock_read(s).is_none(), "a writer ran between capture and relock");
}

/// Invariant 6: after `wakeup_all`, every still-parked waiter eventually
/// makes progress (granted, or re-parks and tries again) rather than
/// sleeping forever.
#[test]
fn invariant6_wakeup_all_unsticks_every_waiter() {
    let lock = Arc::new(SixLock::new(()));
    let held = lock.try_write().unwrap();

    let mut waiters = Vec::new();
    for _ in 0..6 {
        let lock = lock.clone();
        waiters.push(thread::spawn(move || {
            drop(lock.read());
        }));
    }

    // Give the waiters time to actually park.
    thread::sleep(Duration::from_millis(30));
    drop(held);
    lock.wakeup_all();

    for w in waiters {
        w.join().unwrap();
    }
}

/// Invariant 7: with per-CPU readers enabled, the per-shard sum always
/// equals the logical reader count at quiescent points (no lock held).
#[test]
fn invariant7_percpu_sum_matches_logical_count_at_rest() {
    const THREADS: usize = 8;
    const ITERS: usize = 500;

    let lock = Arc::new(SixLock::new(()));
    lock.pcpu_enable();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = lock.clone();
            thread::spawn(move || {
                for _ in 0..ITERS {
                    drop(lock.read());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.counts().read, 0);
    lock.pcpu_disable();
}

/// Invariant 8: intent/write grants honor admission order among same-mode
/// waiters (FIFO), not arrival-order-independent scheduling luck.
#[test]
fn invariant8_fifo_admission_order_for_write_waiters() {
    const WAITERS: usize = 5;

    let lock = Arc::new(SixLock::new(()));
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = lock.try_write().unwrap();

    let handles: Vec<_> = (0..WAITERS)
        .map(|i| {
            let lock = lock.clone();
            let order = order.clone();
            // Staggered starts so each thread reaches the waitlist (and is
            // enqueued) strictly after the previous one.
            thread::sleep(Duration::from_millis(5));
            let handle = thread::spawn(move || {
                let _w = lock.write();
                order.lock().unwrap().push(i);
            });
            handle
        })
        .collect();

    thread::sleep(Duration::from_millis(30));
    drop(held);

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), (0..WAITERS).collect::<Vec<_>>());
}
