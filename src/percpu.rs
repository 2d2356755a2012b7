//! Per-shard reader counters — the userspace stand-in for `six.c`'s
//! per-CPU reader array.
//!
//! The kernel source pins a counter to each CPU with `preempt_disable()`
//! and sums them with `for_each_possible_cpu`. Userspace Rust has no
//! portable, safe way to pin a thread to a CPU or to read "which CPU am I
//! on" without platform-specific code, so this crate approximates the same
//! idea with a fixed number of shards (sized by [`num_cpus::get`]) and a
//! first-touch, round-robin assignment of each thread to one shard,
//! cached in a thread-local cell. The handshake the source depends on —
//! store-then-full-barrier-then-load on the writer side, and the mirror on
//! the reader side — is preserved exactly; only "which counter" changed.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::state::RawState;

thread_local! {
    static SHARD: Cell<usize> = const { Cell::new(usize::MAX) };
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

fn shard_for(shard_count: usize) -> usize {
    SHARD.with(|cell| {
        let mut id = cell.get();
        if id == usize::MAX || id >= shard_count {
            id = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % shard_count;
            cell.set(id);
        }
        id
    })
}

/// Per-shard reader counters, installed in place of the in-word
/// `read_lock` field.
pub(crate) struct PerCpuReaders {
    shards: Box<[AtomicUsize]>,
}

impl PerCpuReaders {
    pub(crate) fn new() -> Self {
        let n = num_cpus::get().max(1);
        Self {
            shards: (0..n).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    fn my_shard(&self) -> &AtomicUsize {
        &self.shards[shard_for(self.shards.len())]
    }

    /// Signal "I might hold a read lock", full barrier, then let the
    /// caller load the state word to check for a concurrent writer.
    #[inline]
    pub(crate) fn inc_then_fence(&self) {
        self.my_shard().fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn dec_relaxed(&self) {
        self.my_shard().fetch_sub(1, Ordering::Relaxed);
    }

    /// Plain increment, no barrier. Used by `increment()`/`downgrade()`,
    /// where the caller already holds a mode that guarantees correctness
    /// without an extra fence (mirrors `six_lock_increment`'s bare
    /// `this_cpu_inc`).
    #[inline]
    pub(crate) fn inc_relaxed(&self) {
        self.my_shard().fetch_add(1, Ordering::Relaxed);
    }

    /// Mirrors `unlock_read`'s full-barrier; full-barrier sandwich around
    /// the decrement, returning the post-barrier main-word load.
    #[inline]
    pub(crate) fn unlock_fence_and_load(&self, load_state: impl FnOnce() -> RawState) -> RawState {
        fence(Ordering::SeqCst);
        self.dec_relaxed();
        fence(Ordering::SeqCst);
        load_state()
    }

    #[inline]
    pub(crate) fn sum(&self) -> usize {
        self.shards.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.sum() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_across_shards() {
        let p = PerCpuReaders::new();
        assert!(p.is_empty());
        p.inc_then_fence();
        assert_eq!(p.sum(), 1);
        p.dec_relaxed();
        assert!(p.is_empty());
    }
}
