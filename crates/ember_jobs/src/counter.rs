use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use std::sync::{Arc, Condvar, Mutex, PoisonError};

// -----------------------------------------------------------------------------
// Counter

/// Dispatch/wait rendezvous for a batch of jobs.
///
/// A counter tracks how many dispatched jobs are still in flight. Dispatching
/// `n` jobs against a counter raises its count by `n` before any of the
/// handles become visible to workers; every job's final step lowers it by
/// exactly one. When the count reaches zero the blocking flag is cleared and
/// every thread parked in [`Scheduler::wait_for_counter`] is woken.
///
/// `Counter` is a cheap handle: cloning shares the same underlying state, and
/// every job dispatched against it keeps the state alive until its final step
/// has run. Waiting on a counter that was never used returns immediately.
///
/// ```
/// use ember_jobs::Counter;
///
/// let counter = Counter::new();
/// assert_eq!(counter.count(), 0);
/// ```
///
/// [`Scheduler::wait_for_counter`]: crate::Scheduler::wait_for_counter
#[derive(Clone, Default)]
pub struct Counter(Arc<Inner>);

#[derive(Default)]
struct Inner {
    /// Number of dispatched jobs whose final step has not yet run.
    count: AtomicUsize,
    /// Set by a parked waiter, cleared by suspension and by the count
    /// reaching zero.
    blocking: AtomicBool,
    /// Parking support for waiters; the atomics above are the actual state.
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl Counter {
    /// Creates a counter with no jobs in flight.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs dispatched against this counter that have not yet
    /// completed their final step.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count.load(Ordering::Acquire)
    }

    /// Whether some thread has announced it is about to park on this counter.
    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.0.blocking.load(Ordering::Acquire)
    }

    /// Raises the in-flight count by `n`.
    ///
    /// Must happen before the corresponding handles are published to any
    /// queue, so a waiter can never observe a count that under-reports
    /// runnable work.
    #[inline]
    pub(crate) fn add(&self, n: usize) {
        self.0.count.fetch_add(n, Ordering::Release);
    }

    /// Final-step bookkeeping: lowers the count by one and wakes all parked
    /// waiters if this was the last in-flight job.
    pub(crate) fn complete_one(&self) {
        let previous = self.0.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "counter completed more jobs than were dispatched");
        if previous == 1 {
            self.unblock();
        }
    }

    /// Clears the blocking flag and wakes all parked waiters.
    ///
    /// Called on every job suspension as well as on the count reaching zero:
    /// a sleeping thread must get a chance to pick the re-queued work up.
    pub(crate) fn unblock(&self) {
        {
            let _guard = self.0.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.0.blocking.store(false, Ordering::Release);
        }
        self.0.wakeup.notify_all();
    }

    /// Announces that the calling thread intends to park.
    ///
    /// The caller must re-check [`count`](Self::count) afterwards before
    /// actually parking; that re-check is what closes the window against a
    /// final step that ran in between.
    #[inline]
    pub(crate) fn begin_blocking(&self) {
        self.0.blocking.store(true, Ordering::Release);
    }

    /// Retracts [`begin_blocking`](Self::begin_blocking) without waking
    /// anyone; used when the post-announce re-check found the count at zero.
    #[inline]
    pub(crate) fn cancel_blocking(&self) {
        self.0.blocking.store(false, Ordering::Release);
    }

    /// Parks until the blocking flag is cleared or the count reaches zero.
    pub(crate) fn park(&self) {
        let mut guard = self.0.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.0.blocking.load(Ordering::Acquire) && self.count() > 0 {
            guard = self
                .0
                .wakeup
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl core::fmt::Debug for Counter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Counter")
            .field("count", &self.count())
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tests
