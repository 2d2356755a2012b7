//! Optional, pluggable instrumentation.
//!
//! This is deliberately *not* a lockdep replacement: it does no
//! dependency-cycle tracking and makes no attempt at deadlock prediction.
//! It exists only as the "leave insertion points" hook the design calls
//! for, so a caller can wire up its own accounting (contention counters, a
//! tracing span, a custom lockdep-alike) without this crate taking a
//! dependency on any particular observability stack.
//!
//! Implementations must not acquire locks or allocate: callbacks may run
//! with the waitlist spinlock already released but on a hot path, and
//! never while any lock internal to this crate is held.

use crate::Mode;

/// Insertion points for pluggable lock instrumentation.
///
/// All methods have no-op default implementations, so an observer can
/// implement only the events it cares about.
pub trait LockObserver {
    /// Called when a blocking acquire could not be satisfied immediately
    /// and the caller is about to enqueue on the waitlist.
    fn contended(&self, _mode: Mode) {}
    /// Called once a mode has been granted, whether via the fast path or
    /// after waking from the waitlist.
    fn acquired(&self, _mode: Mode) {}
    /// Called when a mode is released.
    fn released(&self, _mode: Mode) {}
}

/// An observer that does nothing; the default when none is installed.
pub(crate) struct NullObserver;

impl LockObserver for NullObserver {}

pub(crate) static NULL_OBSERVER: NullObserver = NullObserver;

#[cfg(feature = "log")]
macro_rules! trace_event {
    ($name:literal, $mode:expr) => {
        log::trace!(target: "sixlock", "{} mode={:?}", $name, $mode)
    };
}

pub(crate) fn trace_contended(mode: Mode) {
    #[cfg(feature = "log")]
    trace_event!("contended", mode);
    #[cfg(not(feature = "log"))]
    let _ = mode;
}

pub(crate) fn trace_parked(mode: Mode) {
    #[cfg(feature = "log")]
    trace_event!("parked", mode);
    #[cfg(not(feature = "log"))]
    let _ = mode;
}

pub(crate) fn trace_woken(mode: Mode) {
    #[cfg(feature = "log")]
    trace_event!("woken", mode);
    #[cfg(not(feature = "log"))]
    let _ = mode;
}

pub(crate) fn trace_cascade(from: Mode, to: Mode) {
    #[cfg(feature = "log")]
    log::trace!(target: "sixlock", "cascade from={:?} to={:?}", from, to);
    #[cfg(not(feature = "log"))]
    let _ = (from, to);
}
