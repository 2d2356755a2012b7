//! The FIFO waitlist: a short spinlock-guarded queue of parked waiters.
//!
//! This is the direct analogue of `six.c`'s `wait_lock` + `wait_list`
//! (a `raw_spinlock_t` guarding an intrusive doubly-linked list). The
//! `spin` crate's `SpinMutex` guards it, the same short-critical-section
//! role it plays elsewhere in this crate; `VecDeque` plays the role of the
//! intrusive list since ownership in Rust is easier to express through an
//! `Arc` than through raw list pointers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::Instant;

use spin::mutex::SpinMutex;

use crate::Mode;

/// A single parked waiter.
///
/// Owned jointly by the parked thread (which keeps an `Arc` on its stack
/// for the duration of `lock_M`) and the waitlist (which holds the other
/// `Arc` while the waiter is queued). Once `acquired` is set, the waker
/// must not touch the waiter again — mirroring the source's "no writes to
/// `w` besides `lock_acquired`" rule.
pub(crate) struct Waiter {
    pub(crate) thread: Thread,
    pub(crate) mode: Mode,
    pub(crate) acquired: AtomicBool,
    pub(crate) start_time: Instant,
}

impl Waiter {
    pub(crate) fn new(mode: Mode, start_time: Instant) -> Arc<Self> {
        Arc::new(Self {
            thread: std::thread::current(),
            mode,
            acquired: AtomicBool::new(false),
            start_time,
        })
    }

    #[inline]
    pub(crate) fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }

    /// Grants the lock to this waiter. Must be the last write to the
    /// waiter before unparking it.
    #[inline]
    pub(crate) fn grant(&self) {
        self.acquired.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

pub(crate) struct Waitlist {
    queue: SpinMutex<VecDeque<Arc<Waiter>>>,
}

impl Waitlist {
    pub(crate) const fn new() -> Self {
        Self {
            queue: SpinMutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn lock(&self) -> spin::mutex::SpinMutexGuard<'_, VecDeque<Arc<Waiter>>> {
        self.queue.lock()
    }

    /// Appends `waiter`, bumping its `start_time` past the current tail's
    /// if a collision would otherwise break strict monotonicity. Purely
    /// diagnostic — FIFO order comes from queue position, not from this
    /// timestamp.
    pub(crate) fn push_back_monotone(
        queue: &mut VecDeque<Arc<Waiter>>,
        waiter: Arc<Waiter>,
    ) -> Arc<Waiter> {
        let waiter = if let Some(last) = queue.back() {
            if waiter.start_time <= last.start_time {
                Arc::new(Waiter {
                    thread: waiter.thread.clone(),
                    mode: waiter.mode,
                    acquired: AtomicBool::new(false),
                    start_time: last.start_time + std::time::Duration::from_nanos(1),
                })
            } else {
                waiter
            }
        } else {
            waiter
        };
        queue.push_back(waiter.clone());
        waiter
    }

    pub(crate) fn remove(queue: &mut VecDeque<Arc<Waiter>>, waiter: &Arc<Waiter>) {
        if let Some(idx) = queue.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            queue.remove(idx);
        }
    }

    pub(crate) fn has_mode(queue: &VecDeque<Arc<Waiter>>, mode: Mode) -> bool {
        queue.iter().any(|w| w.mode == mode)
    }
}
