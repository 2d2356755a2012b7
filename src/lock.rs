//! The lock itself: acquisition, release, cascading wakeup, and the
//! downgrade/upgrade/convert/increment family of conversions.
//!
//! This is the direct Rust analogue of `six.c`'s `__do_six_trylock_type`,
//! `__six_lock_type_slowpath`, `__six_lock_wakeup` and friends. The guard
//! types (`ReadGuard`/`IntentGuard`/`WriteGuard`) follow the `ReadGuard`/
//! `WriteGuard` shape over an `UnsafeCell<T>` used elsewhere in this crate's
//! lineage, generalized to a third mode.

use std::cell::UnsafeCell;
use std::convert::Infallible;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::{Duration, Instant};

use spin::mutex::SpinMutex;

use crate::observer::{trace_cascade, trace_contended, trace_parked, trace_woken, LockObserver, NULL_OBSERVER};
#[cfg(feature = "percpu")]
use crate::percpu::PerCpuReaders;
use crate::state::{lock_vals, waiters_bit, RawState, StateWord, INTENT_LOCK_ONE, READ_LOCK_ONE, WRITE_LOCKING_BIT};
use crate::waitlist::{Waiter, Waitlist};
use crate::Mode;

/// How many bounded spin-loop iterations a blocked reader, or the
/// head-of-queue intent waiter, will busy-wait on the current intent owner
/// before falling back to parking.
///
/// `six_optimistic_spin` keeps spinning as long as the owner is still
/// running on its CPU and the scheduler hasn't asked for a reschedule,
/// neither of which userspace can observe; this bounded count is the
/// closest analogue that still avoids parking for the common case of a
/// short critical section.
const OPTIMISTIC_SPIN_ATTEMPTS: u32 = 1_000;

/// How often a parked waiter wakes up to re-poll `should_sleep_fn` and its
/// own `acquired` flag. Real grants always `unpark()` directly; this is
/// only a safety net against a missed wakeup racing with `park_timeout`.
const PARK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Outcome of a single atomic attempt to transition the state word.
enum TryOutcome {
    Success,
    Failure,
    /// The attempt failed, but in a way that means some other mode's
    /// waiters might now be grantable and should be woken.
    Cascade(Mode),
}

/// A pre-allocated slot a caller can pass to the `_with_waiter` family of
/// lock calls, so the same [`Waiter`] handle is reused (and observable)
/// across repeated lock attempts rather than allocated fresh each time.
pub struct WaiterSlot(SpinMutex<Option<Arc<Waiter>>>);

impl WaiterSlot {
    pub const fn new() -> Self {
        Self(SpinMutex::new(None))
    }
}

impl Default for WaiterSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time counts for each mode, as read by [`SixLock::counts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockCounts {
    pub read: usize,
    pub intent: usize,
    pub write: usize,
}

/// A three-mode read/intent/write lock guarding a `T`.
pub struct SixLock<T: ?Sized> {
    state: StateWord,
    waitlist: Waitlist,
    intent_owner: SpinMutex<Option<Thread>>,
    intent_recurse: AtomicUsize,
    #[cfg(feature = "percpu")]
    percpu: SpinMutex<Option<Arc<PerCpuReaders>>>,
    observer: Option<&'static dyn LockObserver>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SixLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SixLock<T> {}

impl<T> SixLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: StateWord::new(),
            waitlist: Waitlist::new(),
            intent_owner: SpinMutex::new(None),
            intent_recurse: AtomicUsize::new(0),
            #[cfg(feature = "percpu")]
            percpu: SpinMutex::new(None),
            observer: None,
            data: UnsafeCell::new(data),
        }
    }

    /// Like [`Self::new`], but with a [`LockObserver`] wired up from the
    /// start.
    pub fn with_observer(data: T, observer: &'static dyn LockObserver) -> Self {
        let mut lock = Self::new(data);
        lock.observer = Some(observer);
        lock
    }
}

impl<T: ?Sized> SixLock<T> {
    #[inline]
    fn observer(&self) -> &dyn LockObserver {
        self.observer.unwrap_or(&NULL_OBSERVER)
    }

    fn note_contended(&self, mode: Mode) {
        trace_contended(mode);
        self.observer().contended(mode);
    }

    fn note_acquired(&self, mode: Mode) {
        self.observer().acquired(mode);
    }

    fn note_released(&self, mode: Mode) {
        self.observer().released(mode);
    }

    #[cfg(feature = "percpu")]
    fn percpu_snapshot(&self) -> Option<Arc<PerCpuReaders>> {
        self.percpu.lock().clone()
    }

    fn set_intent_owner(&self, task: &Thread) {
        *self.intent_owner.lock() = Some(task.clone());
    }

    // ---- try_acquire: the three dispatch cases from §4.1 ------------

    fn try_acquire(&self, mode: Mode, task: &Thread, explicit_try: bool) -> TryOutcome {
        #[cfg(feature = "percpu")]
        {
            if mode == Mode::Read {
                if let Some(pc) = self.percpu_snapshot() {
                    return self.try_acquire_read_percpu(&pc);
                }
            } else if mode == Mode::Write {
                if let Some(pc) = self.percpu_snapshot() {
                    return self.try_acquire_write_percpu(&pc, explicit_try);
                }
            }
        }
        self.try_acquire_cas(mode, task, explicit_try)
    }

    #[cfg(feature = "percpu")]
    fn try_acquire_read_percpu(&self, pc: &PerCpuReaders) -> TryOutcome {
        pc.inc_then_fence();
        let old = self.state.load(Ordering::Relaxed);
        if !old.write_locking() && !old.write_held() {
            TryOutcome::Success
        } else {
            pc.dec_relaxed();
            if old.write_locking() {
                TryOutcome::Cascade(Mode::Write)
            } else {
                TryOutcome::Failure
            }
        }
    }

    #[cfg(feature = "percpu")]
    fn try_acquire_write_percpu(&self, pc: &PerCpuReaders, explicit_try: bool) -> TryOutcome {
        if explicit_try {
            self.state.fetch_or(WRITE_LOCKING_BIT, Ordering::Relaxed);
            std::sync::atomic::fence(Ordering::SeqCst);
        }

        let success = pc.is_empty();
        let mut delta: u64 = 0;
        if success {
            delta = delta.wrapping_add(crate::state::SEQ_ONE);
        }
        if success || explicit_try {
            delta = delta.wrapping_sub(WRITE_LOCKING_BIT);
        }
        if !success && !explicit_try {
            let cur = self.state.load(Ordering::Relaxed);
            if !cur.has_waiter(Mode::Write) {
                delta = delta.wrapping_add(waiters_bit(Mode::Write));
            }
        }

        if explicit_try && !success {
            let old = self.state.fetch_add(delta, Ordering::AcqRel);
            if old.has_waiter(Mode::Read) {
                return TryOutcome::Cascade(Mode::Read);
            }
            TryOutcome::Failure
        } else {
            self.state.fetch_add(delta, Ordering::Relaxed);
            if success {
                TryOutcome::Success
            } else {
                TryOutcome::Failure
            }
        }
    }

    fn try_acquire_cas(&self, mode: Mode, task: &Thread, explicit_try: bool) -> TryOutcome {
        let vals = lock_vals(mode);
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            let fail = cur.0 & vals.lock_fail != 0;
            let new_val = if !fail {
                if mode == Mode::Read {
                    debug_assert!(
                        cur.read_lock() < crate::state::READ_LOCK_MAX,
                        "read_lock field about to overflow its 25-bit width"
                    );
                }
                let mut v = cur.0.wrapping_add(vals.lock_val);
                if mode == Mode::Write {
                    v &= !WRITE_LOCKING_BIT;
                }
                v
            } else if !explicit_try && cur.0 & waiters_bit(mode) == 0 {
                cur.0 | waiters_bit(mode)
            } else {
                return TryOutcome::Failure;
            };

            match self
                .state
                .compare_exchange_weak(cur, RawState(new_val), Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(old) => {
                    let ok = old.0 & vals.lock_fail == 0;
                    if ok && mode == Mode::Intent {
                        self.set_intent_owner(task);
                    }
                    return if ok { TryOutcome::Success } else { TryOutcome::Failure };
                }
                Err(actual) => cur = actual,
            }
        }
    }

    fn do_trylock(&self, mode: Mode, explicit_try: bool) -> bool {
        let task = std::thread::current();
        match self.try_acquire(mode, &task, explicit_try) {
            TryOutcome::Success => true,
            TryOutcome::Failure => false,
            TryOutcome::Cascade(target) => {
                self.wakeup_slow(target);
                false
            }
        }
    }

    // ---- try_M / lock_M public surface -------------------------------

    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        if self.do_trylock(Mode::Read, true) {
            self.note_acquired(Mode::Read);
            Some(ReadGuard { lock: self })
        } else {
            None
        }
    }

    pub fn try_intent(&self) -> Option<IntentGuard<'_, T>> {
        if self.do_trylock(Mode::Intent, true) {
            self.note_acquired(Mode::Intent);
            Some(IntentGuard { lock: self })
        } else {
            None
        }
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        if self.do_trylock(Mode::Write, true) {
            self.note_acquired(Mode::Write);
            Some(WriteGuard { lock: self })
        } else {
            None
        }
    }

    /// Blocks until read mode is granted. Never returns an error: there is
    /// no `should_sleep_fn` installed, so nothing can ever request
    /// cancellation.
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.lock_mode::<Infallible>(Mode::Read, None).unwrap();
        ReadGuard { lock: self }
    }

    pub fn intent(&self) -> IntentGuard<'_, T> {
        self.lock_mode::<Infallible>(Mode::Intent, None).unwrap();
        IntentGuard { lock: self }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        self.lock_mode::<Infallible>(Mode::Write, None).unwrap();
        WriteGuard { lock: self }
    }

    /// Blocks until read mode is granted or `should_sleep_fn` returns
    /// `Some(c)`, in which case the attempt is cancelled and `Err(c)` is
    /// returned.
    pub fn lock_read<C>(&self, mut should_sleep_fn: impl FnMut(&Self) -> Option<C>) -> Result<ReadGuard<'_, T>, C> {
        self.lock_mode(Mode::Read, Some(&mut should_sleep_fn as &mut dyn FnMut(&Self) -> Option<C>))?;
        Ok(ReadGuard { lock: self })
    }

    pub fn lock_intent<C>(&self, mut should_sleep_fn: impl FnMut(&Self) -> Option<C>) -> Result<IntentGuard<'_, T>, C> {
        self.lock_mode(Mode::Intent, Some(&mut should_sleep_fn as &mut dyn FnMut(&Self) -> Option<C>))?;
        Ok(IntentGuard { lock: self })
    }

    pub fn lock_write<C>(&self, mut should_sleep_fn: impl FnMut(&Self) -> Option<C>) -> Result<WriteGuard<'_, T>, C> {
        self.lock_mode(Mode::Write, Some(&mut should_sleep_fn as &mut dyn FnMut(&Self) -> Option<C>))?;
        Ok(WriteGuard { lock: self })
    }

    /// Like [`Self::lock_read`], but uses the caller-supplied `slot` for
    /// the waitlist entry instead of allocating an ephemeral one, so the
    /// caller can keep observing (or cancel) the waiter from elsewhere.
    pub fn lock_read_with_waiter<C>(
        &self,
        slot: &WaiterSlot,
        mut should_sleep_fn: impl FnMut(&Self) -> Option<C>,
    ) -> Result<ReadGuard<'_, T>, C> {
        if self.do_trylock(Mode::Read, true) {
            self.note_acquired(Mode::Read);
            return Ok(ReadGuard { lock: self });
        }
        self.lock_slow(Mode::Read, slot, Some(&mut should_sleep_fn as &mut dyn FnMut(&Self) -> Option<C>))?;
        Ok(ReadGuard { lock: self })
    }

    pub fn lock_intent_with_waiter<C>(
        &self,
        slot: &WaiterSlot,
        mut should_sleep_fn: impl FnMut(&Self) -> Option<C>,
    ) -> Result<IntentGuard<'_, T>, C> {
        if self.do_trylock(Mode::Intent, true) {
            self.note_acquired(Mode::Intent);
            return Ok(IntentGuard { lock: self });
        }
        self.lock_slow(Mode::Intent, slot, Some(&mut should_sleep_fn as &mut dyn FnMut(&Self) -> Option<C>))?;
        Ok(IntentGuard { lock: self })
    }

    pub fn lock_write_with_waiter<C>(
        &self,
        slot: &WaiterSlot,
        mut should_sleep_fn: impl FnMut(&Self) -> Option<C>,
    ) -> Result<WriteGuard<'_, T>, C> {
        if self.do_trylock(Mode::Write, true) {
            self.note_acquired(Mode::Write);
            return Ok(WriteGuard { lock: self });
        }
        self.lock_slow(Mode::Write, slot, Some(&mut should_sleep_fn as &mut dyn FnMut(&Self) -> Option<C>))?;
        Ok(WriteGuard { lock: self })
    }

    fn lock_mode<C>(&self, mode: Mode, should_sleep_fn: Option<&mut dyn FnMut(&Self) -> Option<C>>) -> Result<(), C> {
        if self.do_trylock(mode, true) {
            self.note_acquired(mode);
            return Ok(());
        }
        let slot = WaiterSlot::new();
        self.lock_slow(mode, &slot, should_sleep_fn)
    }

    /// `__six_lock_type_slowpath`: publish intent to wait, retry once under
    /// the waitlist spinlock (cascading a wakeup if that retry says to),
    /// enqueue if still unacquired, optimistically spin, then park.
    fn lock_slow<C>(
        &self,
        mode: Mode,
        slot: &WaiterSlot,
        mut should_sleep_fn: Option<&mut dyn FnMut(&Self) -> Option<C>>,
    ) -> Result<(), C> {
        if mode == Mode::Write {
            self.state.fetch_or(WRITE_LOCKING_BIT, Ordering::Relaxed);
            std::sync::atomic::fence(Ordering::SeqCst);
        }
        self.note_contended(mode);

        let task = std::thread::current();
        let mut list = self.waitlist.lock();
        if self.state.load(Ordering::Relaxed).0 & waiters_bit(mode) == 0 {
            self.state.fetch_or(waiters_bit(mode), Ordering::Relaxed);
        }
        let retry = self.try_acquire(mode, &task, false);

        let waiter = if matches!(retry, TryOutcome::Success) {
            None
        } else {
            let w = Waiter::new(mode, start_time());
            let w = Waitlist::push_back_monotone(&mut list, w);
            *slot.0.lock() = Some(w.clone());
            Some(w)
        };
        drop(list);

        if let TryOutcome::Success = retry {
            self.note_acquired(mode);
            return Ok(());
        }
        if let TryOutcome::Cascade(target) = retry {
            self.wakeup_slow(target);
        }
        let waiter = waiter.expect("enqueued whenever the retry was not an immediate success");

        trace_parked(mode);
        if self.try_optimistic_spin(&waiter) {
            *slot.0.lock() = None;
            self.note_acquired(mode);
            return Ok(());
        }

        loop {
            if waiter.is_acquired() {
                break;
            }
            if let Some(f) = should_sleep_fn.as_deref_mut() {
                if let Some(cancel) = f(self) {
                    // The waitlist spinlock is the same one a granter holds
                    // while removing the waiter and setting `acquired`
                    // (`wakeup_slow`), so checking under it here is
                    // race-free: either the grant already fully happened,
                    // or we still get to remove it ourselves.
                    let mut list = self.waitlist.lock();
                    let granted = waiter.is_acquired();
                    if !granted {
                        Waitlist::remove(&mut list, &waiter);
                    }
                    drop(list);
                    *slot.0.lock() = None;

                    if granted {
                        self.unlock_mode(mode);
                    } else if mode == Mode::Write {
                        self.cancel_cleanup_write_locking();
                    }
                    return Err(cancel);
                }
            }
            std::thread::park_timeout(PARK_POLL_INTERVAL);
        }

        *slot.0.lock() = None;
        self.note_acquired(mode);
        Ok(())
    }

    fn cancel_cleanup_write_locking(&self) {
        let old = self.state.fetch_and(!WRITE_LOCKING_BIT, Ordering::Relaxed);
        if old.write_locking() {
            let new = RawState(old.0 & !WRITE_LOCKING_BIT);
            self.wakeup(new, Mode::Read);
        }
    }

    /// `six_optimistic_spin`: readers always try; the head-of-queue intent
    /// waiter tries; writers never do (there's nothing useful to spin on
    /// — a writer needs every reader drained, not just one owner to let
    /// go).
    fn try_optimistic_spin(&self, waiter: &Arc<Waiter>) -> bool {
        match waiter.mode {
            Mode::Write => return false,
            Mode::Intent => {
                let list = self.waitlist.lock();
                let is_head = list.front().map(|w| Arc::ptr_eq(w, waiter)).unwrap_or(false);
                drop(list);
                if !is_head {
                    return false;
                }
            }
            Mode::Read => {}
        }

        let owner = match self.intent_owner.lock().clone() {
            Some(owner) => owner,
            None => return waiter.is_acquired(),
        };

        for _ in 0..OPTIMISTIC_SPIN_ATTEMPTS {
            if waiter.is_acquired() {
                return true;
            }
            match self.intent_owner.lock().clone() {
                Some(ref cur) if cur.id() == owner.id() => core::hint::spin_loop(),
                _ => break,
            }
        }
        waiter.is_acquired()
    }

    // ---- unlock / wakeup ---------------------------------------------

    fn unlock_mode(&self, mode: Mode) {
        if mode == Mode::Intent {
            if self.intent_recurse.load(Ordering::Relaxed) > 0 {
                self.intent_recurse.fetch_sub(1, Ordering::Relaxed);
                self.note_released(mode);
                return;
            }
            *self.intent_owner.lock() = None;
        }

        #[cfg(feature = "percpu")]
        if mode == Mode::Read {
            if let Some(pc) = self.percpu_snapshot() {
                let state = pc.unlock_fence_and_load(|| self.state.load(Ordering::Relaxed));
                self.note_released(mode);
                self.wakeup(state, lock_vals(mode).unlock_wakeup);
                return;
            }
        }

        let state = self.atomic_unlock(mode);
        self.note_released(mode);
        self.wakeup(state, lock_vals(mode).unlock_wakeup);
    }

    fn atomic_unlock(&self, mode: Mode) -> RawState {
        let vals = lock_vals(mode);
        let old = self.state.fetch_add(vals.unlock_val, Ordering::Release);
        RawState(old.0.wrapping_add(vals.unlock_val))
    }

    /// `six_lock_wakeup`: the cheap fast-path check (skip entirely if the
    /// released state gives no hint that `target` has anything to gain),
    /// otherwise hand off to the queue walk.
    fn wakeup(&self, state: RawState, target: Mode) {
        if target == Mode::Write && state.read_lock() != 0 {
            return;
        }
        if !state.has_waiter(target) {
            return;
        }
        self.wakeup_slow(target);
    }

    /// `__six_lock_wakeup`: walk the FIFO queue granting every matching
    /// waiter for `read`, or at most one for `intent`/`write`; cascade into
    /// whichever other mode a grant attempt says to, until nothing's left
    /// to cascade into.
    fn wakeup_slow(&self, mut target: Mode) {
        loop {
            let mut list = self.waitlist.lock();
            let mut saw_one = false;
            let mut cascade = None;
            let mut i = 0;
            while i < list.len() {
                if list[i].mode != target {
                    i += 1;
                    continue;
                }
                if saw_one && target != Mode::Read {
                    break;
                }
                saw_one = true;

                match self.try_acquire(target, &list[i].thread.clone(), false) {
                    TryOutcome::Cascade(m) => {
                        cascade = Some(m);
                        break;
                    }
                    TryOutcome::Failure => break,
                    TryOutcome::Success => {
                        let w = list.remove(i).unwrap();
                        trace_woken(target);
                        w.grant();
                    }
                }
            }
            if !Waitlist::has_mode(&list, target) {
                self.state.fetch_and(!waiters_bit(target), Ordering::Relaxed);
            }
            drop(list);

            match cascade {
                Some(next) => {
                    trace_cascade(target, next);
                    target = next;
                }
                None => return,
            }
        }
    }

    /// Unparks every waiter still in the queue, granted or not, so a
    /// caller can force every blocked task to re-check its own exit
    /// condition (e.g. after installing a new `should_sleep_fn` predicate
    /// out of band). Mirrors `six_lock_wakeup_all`.
    pub fn wakeup_all(&self) {
        let state = self.state.load(Ordering::Relaxed);
        self.wakeup(state, Mode::Read);
        self.wakeup(state, Mode::Intent);
        self.wakeup(state, Mode::Write);

        let list = self.waitlist.lock();
        for w in list.iter() {
            w.thread.unpark();
        }
    }

    // ---- relock --------------------------------------------------------

    pub fn relock_read(&self, seq: u32) -> Option<ReadGuard<'_, T>> {
        if self.relock_mode(Mode::Read, seq) {
            Some(ReadGuard { lock: self })
        } else {
            None
        }
    }

    pub fn relock_intent(&self, seq: u32) -> Option<IntentGuard<'_, T>> {
        if self.relock_mode(Mode::Intent, seq) {
            Some(IntentGuard { lock: self })
        } else {
            None
        }
    }

    fn relock_mode(&self, mode: Mode, seq: u32) -> bool {
        debug_assert!(mode != Mode::Write, "write mode has no relock: seq always advances");

        #[cfg(feature = "percpu")]
        if mode == Mode::Read {
            if let Some(pc) = self.percpu_snapshot() {
                pc.inc_then_fence();
                let old = self.state.load(Ordering::Relaxed);
                let ok = !old.write_locking() && !old.write_held() && old.seq() == seq;
                if !ok {
                    pc.dec_relaxed();
                }
                if old.write_locking() {
                    self.wakeup(old, Mode::Write);
                }
                if ok {
                    self.note_acquired(mode);
                }
                return ok;
            }
        }

        let vals = lock_vals(mode);
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur.seq() != seq || cur.0 & vals.lock_fail != 0 {
                return false;
            }
            let new = RawState(cur.0.wrapping_add(vals.lock_val));
            match self.state.compare_exchange_weak(cur, new, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => {
                    if mode == Mode::Intent {
                        let task = std::thread::current();
                        self.set_intent_owner(&task);
                    }
                    self.note_acquired(mode);
                    return true;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    // ---- conversions ----------------------------------------------------

    /// Bumps the recursion count for `mode` without taking a new
    /// atomic transition; the caller must already hold `mode` and must
    /// later call the matching number of unlocks. Write mode has no
    /// recursion (bcachefs never recurses a write lock).
    pub fn increment(&self, mode: Mode) {
        match mode {
            Mode::Read => {
                #[cfg(feature = "percpu")]
                if let Some(pc) = self.percpu_snapshot() {
                    pc.inc_relaxed();
                    return;
                }
                debug_assert!(
                    self.state.load(Ordering::Relaxed).read_lock() < crate::state::READ_LOCK_MAX,
                    "read_lock field about to overflow its 25-bit width"
                );
                self.state.fetch_add(READ_LOCK_ONE, Ordering::Relaxed);
            }
            Mode::Intent => {
                debug_assert!(self.state.load(Ordering::Relaxed).intent_lock() != 0);
                self.intent_recurse.fetch_add(1, Ordering::Relaxed);
            }
            Mode::Write => panic!("write mode cannot be incremented"),
        }
    }

    /// Converts a held intent lock into a read lock: adds a read count,
    /// then releases intent. Never fails — unlike `try_upgrade`, there is
    /// no conflicting holder to lose a race against.
    pub fn downgrade(&self) {
        self.increment(Mode::Read);
        self.unlock_mode(Mode::Intent);
    }

    /// Converts a held read lock into intent, if no one else holds intent.
    /// On success, the read count this call held is folded into the new
    /// intent lock (not released separately).
    pub fn try_upgrade(&self) -> bool {
        #[cfg(feature = "percpu")]
        let has_percpu = self.percpu_snapshot().is_some();
        #[cfg(not(feature = "percpu"))]
        let has_percpu = false;

        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur.intent_lock() != 0 {
                return false;
            }
            let mut new = cur.0;
            if !has_percpu {
                debug_assert!(cur.read_lock() != 0);
                new = new.wrapping_sub(READ_LOCK_ONE);
            }
            new |= INTENT_LOCK_ONE;

            match self.state.compare_exchange_weak(cur, RawState(new), Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => {
                    #[cfg(feature = "percpu")]
                    if let Some(pc) = self.percpu_snapshot() {
                        pc.dec_relaxed();
                    }
                    let task = std::thread::current();
                    self.set_intent_owner(&task);
                    return true;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Converts between `read` and `intent` in either direction; neither
    /// endpoint may be `write`. A no-op, returning `true`, if `from == to`.
    pub fn try_convert(&self, from: Mode, to: Mode) -> bool {
        debug_assert!(from != Mode::Write && to != Mode::Write);
        if from == to {
            return true;
        }
        if to == Mode::Read {
            self.downgrade();
            true
        } else {
            self.try_upgrade()
        }
    }

    /// The current sequence number, for a later `relock_M(seq)` call.
    pub fn seq(&self) -> u32 {
        self.state.load(Ordering::Relaxed).seq()
    }

    pub fn counts(&self) -> LockCounts {
        let state = self.state.load(Ordering::Relaxed);
        let intent = state.intent_lock() as usize + self.intent_recurse.load(Ordering::Relaxed);
        let write = state.write_held() as usize;
        #[cfg(feature = "percpu")]
        let read = match self.percpu_snapshot() {
            Some(pc) => pc.sum(),
            None => state.read_lock() as usize,
        };
        #[cfg(not(feature = "percpu"))]
        let read = state.read_lock() as usize;
        LockCounts { read, intent, write }
    }

    #[cfg(feature = "percpu")]
    pub fn pcpu_enable(&self) {
        let mut slot = self.percpu.lock();
        if slot.is_none() {
            *slot = Some(Arc::new(PerCpuReaders::new()));
        }
    }

    #[cfg(feature = "percpu")]
    pub fn pcpu_disable(&self) {
        let mut slot = self.percpu.lock();
        if let Some(pc) = slot.as_ref() {
            debug_assert!(pc.is_empty(), "pcpu_disable called with outstanding per-shard readers");
        }
        *slot = None;
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> SixLock<T> {
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

fn start_time() -> Instant {
    Instant::now()
}

/// Guard granting shared access while read mode is held.
#[must_use = "if unused the read lock immediately releases"]
pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a SixLock<T>,
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_mode(Mode::Read);
    }
}

impl<'a, T: ?Sized> ReadGuard<'a, T> {
    /// Attempts to convert this read lock into intent, consuming the read
    /// guard. Returns the original guard back if someone else already
    /// holds intent.
    pub fn try_upgrade(self) -> Result<IntentGuard<'a, T>, ReadGuard<'a, T>> {
        let lock = self.lock;
        if lock.try_upgrade() {
            std::mem::forget(self);
            Ok(IntentGuard { lock })
        } else {
            Err(self)
        }
    }
}

/// Guard granting no direct data access by itself — intent is a
/// reservation against other future writers, not a read of `T`. Use
/// [`IntentGuard::downgrade`] for shared access or lock write separately
/// through [`IntentGuard::inner`] once reads have drained.
#[must_use = "if unused the intent lock immediately releases"]
pub struct IntentGuard<'a, T: ?Sized> {
    lock: &'a SixLock<T>,
}

impl<T: ?Sized> Drop for IntentGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_mode(Mode::Intent);
    }
}

impl<'a, T: ?Sized> IntentGuard<'a, T> {
    /// The underlying lock, for taking write mode on top of this held
    /// intent (the standard "intent then write" sequencing).
    pub fn inner(&self) -> &'a SixLock<T> {
        self.lock
    }

    /// Recursively bumps the intent hold count; dropping the returned
    /// guard releases only this one increment.
    pub fn increment(&self) -> IntentGuard<'a, T> {
        self.lock.increment(Mode::Intent);
        IntentGuard { lock: self.lock }
    }

    /// Converts held intent into a read lock.
    pub fn downgrade(self) -> ReadGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        lock.downgrade();
        ReadGuard { lock }
    }
}

/// Guard granting exclusive access while write mode is held.
#[must_use = "if unused the write lock immediately releases"]
pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a SixLock<T>,
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_mode(Mode::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_write_blocks_out_everything() {
        let lock = SixLock::new(());
        let w = lock.try_write().unwrap();
        assert!(lock.try_read().is_none());
        assert!(lock.try_intent().is_none());
        assert!(lock.try_write().is_none());
        drop(w);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn intent_coexists_with_reads_but_not_intent() {
        let lock = SixLock::new(());
        let i = lock.try_intent().unwrap();
        let r1 = lock.try_read().unwrap();
        let r2 = lock.try_read().unwrap();
        assert!(lock.try_intent().is_none());
        assert!(lock.try_write().is_none());
        drop((i, r1, r2));
        assert!(lock.try_intent().is_some());
    }

    #[test]
    fn downgrade_then_more_readers() {
        let lock = SixLock::new(());
        let i = lock.try_intent().unwrap();
        let r = i.downgrade();
        assert!(lock.try_read().is_some());
        drop(r);
    }

    #[test]
    fn try_upgrade_succeeds_when_uncontended() {
        let lock = SixLock::new(());
        let r = lock.try_read().unwrap();
        let i = r.try_upgrade().ok().expect("should upgrade with no competing intent");
        drop(i);
    }

    #[test]
    fn try_upgrade_fails_against_existing_intent() {
        let lock = SixLock::new(());
        let _held = lock.try_intent().unwrap();
        let r = lock.try_read().unwrap();
        assert!(r.try_upgrade().is_err());
    }

    #[test]
    fn intent_recursion_needs_matching_unlocks() {
        let lock = SixLock::new(());
        let i1 = lock.try_intent().unwrap();
        let i2 = i1.increment();
        assert!(lock.try_intent().is_none());
        drop(i2);
        assert!(lock.try_intent().is_none());
        drop(i1);
        assert!(lock.try_intent().is_some());
    }

    #[test]
    fn relock_rejects_stale_seq() {
        let lock = SixLock::new(());
        let seq_before = lock.counts();
        let _ = seq_before;
        let w = lock.write();
        drop(w);
        // a fabricated sequence number from "before" must never relock.
        assert!(lock.relock_read(0).is_none());
    }

    #[test]
    fn cross_thread_write_excludes_readers() {
        let lock = Arc::new(SixLock::new(0usize));
        let lock2 = lock.clone();
        let w = lock.try_write().unwrap();
        let handle = thread::spawn(move || lock2.try_read().is_none());
        assert!(handle.join().unwrap());
        drop(w);
    }

    #[test]
    fn blocking_write_wakes_after_reader_drops() {
        let lock = Arc::new(SixLock::new(0usize));
        let r = lock.try_read().unwrap();
        let lock2 = lock.clone();
        let writer = thread::spawn(move || {
            *lock2.write() += 1;
        });
        thread::sleep(Duration::from_millis(20));
        drop(r);
        writer.join().unwrap();
        assert_eq!(*lock.read(), 1);
    }

    #[cfg(feature = "percpu")]
    #[test]
    fn failed_try_write_percpu_cascades_to_blocked_reader() {
        use std::sync::mpsc;

        let lock = Arc::new(SixLock::new(()));
        lock.pcpu_enable();

        // Held for the whole test so the only way the writer can ever
        // succeed is by us dropping it at the very end: any wakeup the
        // blocked reader sees before that point must have come from the
        // cascade on a failed `try_write`, not from a real write unlock.
        let r1 = lock.try_read().unwrap();

        let lock_a = lock.clone();
        let writer = thread::spawn(move || {
            drop(lock_a.write());
        });
        thread::sleep(Duration::from_millis(30));

        let (tx, rx) = mpsc::channel();
        let lock_b = lock.clone();
        let reader = thread::spawn(move || {
            drop(lock_b.read());
            tx.send(()).unwrap();
        });
        thread::sleep(Duration::from_millis(30));

        assert!(lock.try_write().is_none());
        rx.recv_timeout(Duration::from_millis(200))
            .expect("blocked reader was not woken by the failed try_write cascade");

        drop(r1);
        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn cancellation_returns_err_and_releases_waiter_slot() {
        let lock = Arc::new(SixLock::new(()));
        let _w = lock.try_write().unwrap();
        let mut polls = 0;
        let result = lock.lock_read(|_| {
            polls += 1;
            if polls > 3 {
                Some("gave up")
            } else {
                None
            }
        });
        assert_eq!(result.err(), Some("gave up"));
    }
}
