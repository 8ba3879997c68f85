use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crossbeam_utils::CachePadded;

use crate::worker_queue::Priority;

// -----------------------------------------------------------------------------
// QueueKind

/// Which pool a worker refilled its cache from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum QueueKind {
    Local,
    Stealable,
    Global,
}

// -----------------------------------------------------------------------------
// ThreadSlot

/// One thread's counters.
///
/// Updated with relaxed atomics: every field is written by the owning thread
/// except `jobs_lost_to_thieves`, which a successful thief attributes to its
/// victim. Aggregation tolerates the slack that relaxed ordering implies.
#[derive(Default)]
struct ThreadSlot {
    jobs_executed: AtomicU64,
    jobs_submitted: AtomicU64,
    total_job_time_ns: AtomicU64,
    /// `u64::MAX` until the first execution is recorded.
    min_job_time_ns: AtomicU64,
    max_job_time_ns: AtomicU64,

    jobs_by_priority: [AtomicU64; Priority::COUNT],

    steal_attempts: AtomicU64,
    steal_successes: AtomicU64,
    jobs_stolen: AtomicU64,
    jobs_lost_to_thieves: AtomicU64,

    queue_depth_samples: AtomicU64,
    sum_local_queue_depth: AtomicU64,
    sum_stealable_queue_depth: AtomicU64,
    max_local_queue_depth: AtomicU64,
    max_stealable_queue_depth: AtomicU64,

    idle_spins: AtomicU64,
    total_idle_time_ns: AtomicU64,

    local_queue_hits: AtomicU64,
    steal_queue_hits: AtomicU64,
    global_queue_hits: AtomicU64,
}

impl ThreadSlot {
    fn new() -> Self {
        let slot = Self::default();
        slot.min_job_time_ns.store(u64::MAX, Ordering::Relaxed);
        slot
    }

    fn reset(&self) {
        self.jobs_executed.store(0, Ordering::Relaxed);
        self.jobs_submitted.store(0, Ordering::Relaxed);
        self.total_job_time_ns.store(0, Ordering::Relaxed);
        self.min_job_time_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_job_time_ns.store(0, Ordering::Relaxed);
        for lane in &self.jobs_by_priority {
            lane.store(0, Ordering::Relaxed);
        }
        self.steal_attempts.store(0, Ordering::Relaxed);
        self.steal_successes.store(0, Ordering::Relaxed);
        self.jobs_stolen.store(0, Ordering::Relaxed);
        self.jobs_lost_to_thieves.store(0, Ordering::Relaxed);
        self.queue_depth_samples.store(0, Ordering::Relaxed);
        self.sum_local_queue_depth.store(0, Ordering::Relaxed);
        self.sum_stealable_queue_depth.store(0, Ordering::Relaxed);
        self.max_local_queue_depth.store(0, Ordering::Relaxed);
        self.max_stealable_queue_depth.store(0, Ordering::Relaxed);
        self.idle_spins.store(0, Ordering::Relaxed);
        self.total_idle_time_ns.store(0, Ordering::Relaxed);
        self.local_queue_hits.store(0, Ordering::Relaxed);
        self.steal_queue_hits.store(0, Ordering::Relaxed);
        self.global_queue_hits.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ThreadStats {
        ThreadStats {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            total_job_time_ns: self.total_job_time_ns.load(Ordering::Relaxed),
            min_job_time_ns: self.min_job_time_ns.load(Ordering::Relaxed),
            max_job_time_ns: self.max_job_time_ns.load(Ordering::Relaxed),
            jobs_by_priority: self.jobs_by_priority.each_ref().map(|c| c.load(Ordering::Relaxed)),
            steal_attempts: self.steal_attempts.load(Ordering::Relaxed),
            steal_successes: self.steal_successes.load(Ordering::Relaxed),
            jobs_stolen: self.jobs_stolen.load(Ordering::Relaxed),
            jobs_lost_to_thieves: self.jobs_lost_to_thieves.load(Ordering::Relaxed),
            queue_depth_samples: self.queue_depth_samples.load(Ordering::Relaxed),
            sum_local_queue_depth: self.sum_local_queue_depth.load(Ordering::Relaxed),
            sum_stealable_queue_depth: self.sum_stealable_queue_depth.load(Ordering::Relaxed),
            max_local_queue_depth: self.max_local_queue_depth.load(Ordering::Relaxed),
            max_stealable_queue_depth: self.max_stealable_queue_depth.load(Ordering::Relaxed),
            idle_spins: self.idle_spins.load(Ordering::Relaxed),
            total_idle_time_ns: self.total_idle_time_ns.load(Ordering::Relaxed),
            local_queue_hits: self.local_queue_hits.load(Ordering::Relaxed),
            steal_queue_hits: self.steal_queue_hits.load(Ordering::Relaxed),
            global_queue_hits: self.global_queue_hits.load(Ordering::Relaxed),
        }
    }
}

// -----------------------------------------------------------------------------
// ThreadStats

/// Snapshot of one thread's counters. The last slot belongs to non-worker
/// callers (dispatch and waiting from the main thread or elsewhere).
#[derive(Clone, Debug, Default)]
pub struct ThreadStats {
    pub jobs_executed: u64,
    pub jobs_submitted: u64,
    pub total_job_time_ns: u64,
    pub min_job_time_ns: u64,
    pub max_job_time_ns: u64,
    /// Submissions per priority lane, indexed by `Priority as usize`.
    pub jobs_by_priority: [u64; Priority::COUNT],
    pub steal_attempts: u64,
    pub steal_successes: u64,
    pub jobs_stolen: u64,
    pub jobs_lost_to_thieves: u64,
    pub queue_depth_samples: u64,
    pub sum_local_queue_depth: u64,
    pub sum_stealable_queue_depth: u64,
    pub max_local_queue_depth: u64,
    pub max_stealable_queue_depth: u64,
    pub idle_spins: u64,
    pub total_idle_time_ns: u64,
    pub local_queue_hits: u64,
    pub steal_queue_hits: u64,
    pub global_queue_hits: u64,
}

// -----------------------------------------------------------------------------
// GlobalStats

/// Aggregated scheduler statistics.
#[derive(Clone, Debug, Default)]
pub struct GlobalStats {
    pub total_jobs_executed: u64,
    pub total_jobs_submitted: u64,
    pub total_job_time_ns: u64,
    pub average_job_time_us: f64,
    /// Zero when nothing has executed yet.
    pub min_job_time_ns: u64,
    pub max_job_time_ns: u64,

    pub jobs_by_priority: [u64; Priority::COUNT],

    pub total_steal_attempts: u64,
    pub total_steal_successes: u64,
    pub total_jobs_stolen: u64,
    /// Successes over attempts, in percent.
    pub steal_success_rate: f64,

    pub average_local_queue_depth: f64,
    pub average_stealable_queue_depth: f64,
    pub max_queue_depth: u64,

    pub total_idle_spins: u64,
    pub total_idle_time_ns: u64,
    /// Idle time over elapsed wall time across all participating threads
    /// (workers plus the main slot), in percent.
    pub idle_time_percentage: f64,

    /// Coefficient of variation of per-thread executions. Zero for perfect
    /// balance; below 0.2 is considered good, above 0.5 poor.
    pub load_imbalance: f64,

    pub elapsed_seconds: f64,
}

// -----------------------------------------------------------------------------
// JobStats

/// Per-thread scheduler statistics with a snapshot aggregator.
///
/// Recording is wait-free and contention-free: each thread touches its own
/// cache-padded slot. Only [`aggregate`](Self::aggregate) and
/// [`reset`](Self::reset) take a lock, and only against each other.
///
/// The whole recording path compiles away when the `stats` cargo feature is
/// disabled; aggregation then reports zeros.
pub struct JobStats {
    /// One slot per worker plus a trailing slot for non-worker callers.
    slots: Box<[CachePadded<ThreadSlot>]>,
    epoch: Mutex<Instant>,
}

impl JobStats {
    pub(crate) fn new(num_workers: usize) -> Self {
        Self {
            slots: (0..num_workers + 1).map(|_| CachePadded::new(ThreadSlot::new())).collect(),
            epoch: Mutex::new(Instant::now()),
        }
    }

    /// Number of worker slots (the main slot excluded).
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.slots.len() - 1
    }

    #[cfg(feature = "stats")]
    #[inline]
    fn slot(&self, worker: Option<usize>) -> &ThreadSlot {
        match worker {
            Some(index) if index < self.num_workers() => &self.slots[index],
            _ => self.slots.last().expect("always at least the main slot"),
        }
    }

    pub(crate) fn record_submitted(&self, worker: Option<usize>, priority: Priority, count: u64) {
        #[cfg(feature = "stats")]
        {
            let slot = self.slot(worker);
            slot.jobs_submitted.fetch_add(count, Ordering::Relaxed);
            slot.jobs_by_priority[priority.lane()].fetch_add(count, Ordering::Relaxed);
        }
        #[cfg(not(feature = "stats"))]
        let _ = (worker, priority, count);
    }

    pub(crate) fn record_executed(&self, worker: Option<usize>, duration: Duration) {
        #[cfg(feature = "stats")]
        {
            let nanos = duration.as_nanos() as u64;
            let slot = self.slot(worker);
            slot.jobs_executed.fetch_add(1, Ordering::Relaxed);
            slot.total_job_time_ns.fetch_add(nanos, Ordering::Relaxed);
            slot.min_job_time_ns.fetch_min(nanos, Ordering::Relaxed);
            slot.max_job_time_ns.fetch_max(nanos, Ordering::Relaxed);
        }
        #[cfg(not(feature = "stats"))]
        let _ = (worker, duration);
    }

    pub(crate) fn record_steal_attempt(&self, worker: Option<usize>, stolen: u64) {
        #[cfg(feature = "stats")]
        {
            let slot = self.slot(worker);
            slot.steal_attempts.fetch_add(1, Ordering::Relaxed);
            if stolen > 0 {
                slot.steal_successes.fetch_add(1, Ordering::Relaxed);
                slot.jobs_stolen.fetch_add(stolen, Ordering::Relaxed);
            }
        }
        #[cfg(not(feature = "stats"))]
        let _ = (worker, stolen);
    }

    pub(crate) fn record_stolen_from(&self, victim: usize, count: u64) {
        #[cfg(feature = "stats")]
        self.slot(Some(victim)).jobs_lost_to_thieves.fetch_add(count, Ordering::Relaxed);
        #[cfg(not(feature = "stats"))]
        let _ = (victim, count);
    }

    pub(crate) fn record_queue_depth(&self, worker: Option<usize>, local: u64, stealable: u64) {
        #[cfg(feature = "stats")]
        {
            let slot = self.slot(worker);
            slot.queue_depth_samples.fetch_add(1, Ordering::Relaxed);
            slot.sum_local_queue_depth.fetch_add(local, Ordering::Relaxed);
            slot.sum_stealable_queue_depth.fetch_add(stealable, Ordering::Relaxed);
            slot.max_local_queue_depth.fetch_max(local, Ordering::Relaxed);
            slot.max_stealable_queue_depth.fetch_max(stealable, Ordering::Relaxed);
        }
        #[cfg(not(feature = "stats"))]
        let _ = (worker, local, stealable);
    }

    pub(crate) fn record_idle_spin(&self, worker: Option<usize>) {
        #[cfg(feature = "stats")]
        self.slot(worker).idle_spins.fetch_add(1, Ordering::Relaxed);
        #[cfg(not(feature = "stats"))]
        let _ = worker;
    }

    pub(crate) fn record_idle_time(&self, worker: Option<usize>, duration: Duration) {
        #[cfg(feature = "stats")]
        self.slot(worker)
            .total_idle_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        #[cfg(not(feature = "stats"))]
        let _ = (worker, duration);
    }

    pub(crate) fn record_queue_hit(&self, worker: Option<usize>, kind: QueueKind) {
        #[cfg(feature = "stats")]
        {
            let slot = self.slot(worker);
            let counter = match kind {
                QueueKind::Local => &slot.local_queue_hits,
                QueueKind::Stealable => &slot.steal_queue_hits,
                QueueKind::Global => &slot.global_queue_hits,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        #[cfg(not(feature = "stats"))]
        let _ = (worker, kind);
    }

    /// Snapshot of every slot; the trailing entry is the main slot.
    pub fn thread_stats(&self) -> Vec<ThreadStats> {
        self.slots.iter().map(|slot| slot.snapshot()).collect()
    }

    /// Combines every slot into a [`GlobalStats`] snapshot.
    ///
    /// Hot paths are not blocked: recording proceeds concurrently, and a
    /// snapshot taken while workers are running is a consistent-enough view,
    /// not a linearizable one.
    pub fn aggregate(&self) -> GlobalStats {
        let epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);

        let mut stats = GlobalStats { elapsed_seconds: epoch.elapsed().as_secs_f64(), ..GlobalStats::default() };
        let mut min_time = u64::MAX;

        let mut executions_per_thread = Vec::with_capacity(self.slots.len());
        let mut sampled_slots = 0u64;

        for slot in &self.slots {
            let thread = slot.snapshot();

            stats.total_jobs_executed += thread.jobs_executed;
            stats.total_jobs_submitted += thread.jobs_submitted;
            stats.total_job_time_ns += thread.total_job_time_ns;
            min_time = min_time.min(thread.min_job_time_ns);
            stats.max_job_time_ns = stats.max_job_time_ns.max(thread.max_job_time_ns);

            for (total, lane) in stats.jobs_by_priority.iter_mut().zip(thread.jobs_by_priority) {
                *total += lane;
            }

            stats.total_steal_attempts += thread.steal_attempts;
            stats.total_steal_successes += thread.steal_successes;
            stats.total_jobs_stolen += thread.jobs_stolen;

            if thread.queue_depth_samples > 0 {
                sampled_slots += 1;
                stats.average_local_queue_depth +=
                    thread.sum_local_queue_depth as f64 / thread.queue_depth_samples as f64;
                stats.average_stealable_queue_depth +=
                    thread.sum_stealable_queue_depth as f64 / thread.queue_depth_samples as f64;
            }
            stats.max_queue_depth = stats
                .max_queue_depth
                .max(thread.max_local_queue_depth)
                .max(thread.max_stealable_queue_depth);

            stats.total_idle_spins += thread.idle_spins;
            stats.total_idle_time_ns += thread.total_idle_time_ns;

            executions_per_thread.push(thread.jobs_executed);
        }

        if stats.total_jobs_executed > 0 {
            stats.min_job_time_ns = min_time;
            stats.average_job_time_us =
                stats.total_job_time_ns as f64 / stats.total_jobs_executed as f64 / 1_000.0;
        }

        if stats.total_steal_attempts > 0 {
            stats.steal_success_rate =
                stats.total_steal_successes as f64 / stats.total_steal_attempts as f64 * 100.0;
        }

        if sampled_slots > 0 {
            stats.average_local_queue_depth /= sampled_slots as f64;
            stats.average_stealable_queue_depth /= sampled_slots as f64;
        }

        let possible_ns = stats.elapsed_seconds * 1e9 * self.slots.len() as f64;
        if possible_ns > 0.0 {
            stats.idle_time_percentage = stats.total_idle_time_ns as f64 / possible_ns * 100.0;
        }

        let mean = stats.total_jobs_executed as f64 / executions_per_thread.len() as f64;
        if mean > 0.0 {
            let variance = executions_per_thread
                .iter()
                .map(|&count| {
                    let diff = count as f64 - mean;
                    diff * diff
                })
                .sum::<f64>()
                / executions_per_thread.len() as f64;
            stats.load_imbalance = variance.sqrt() / mean;
        }

        stats
    }

    /// Clears every slot and restarts the elapsed-time epoch.
    ///
    /// Recordings racing the reset may survive it; callers wanting an exact
    /// zero baseline should quiesce the scheduler first.
    pub fn reset(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in &self.slots {
            slot.reset();
        }
        *epoch = Instant::now();
    }

    /// Writes a human-readable report to the logging sink at debug severity.
    pub fn log(&self) {
        #[cfg(feature = "stats")]
        {
            let stats = self.aggregate();

            log::debug!(target: "ember_jobs", "==== Job System Statistics ====");
            log::debug!(target: "ember_jobs", "Elapsed Time: {:.2} seconds", stats.elapsed_seconds);

            log::debug!(target: "ember_jobs", "Jobs:");
            log::debug!(target: "ember_jobs", "\tSubmitted: {}", stats.total_jobs_submitted);
            log::debug!(target: "ember_jobs", "\tExecuted: {}", stats.total_jobs_executed);
            log::debug!(
                target: "ember_jobs",
                "\tBy Priority: high {} / normal {} / low {}",
                stats.jobs_by_priority[Priority::High.lane()],
                stats.jobs_by_priority[Priority::Normal.lane()],
                stats.jobs_by_priority[Priority::Low.lane()],
            );

            log::debug!(target: "ember_jobs", "Execution Time:");
            log::debug!(target: "ember_jobs", "\tAverage: {:.2} us", stats.average_job_time_us);
            log::debug!(target: "ember_jobs", "\tMin: {:.2} us", stats.min_job_time_ns as f64 / 1_000.0);
            log::debug!(target: "ember_jobs", "\tMax: {:.2} us", stats.max_job_time_ns as f64 / 1_000.0);

            log::debug!(target: "ember_jobs", "Work Stealing:");
            log::debug!(target: "ember_jobs", "\tAttempts: {}", stats.total_steal_attempts);
            log::debug!(target: "ember_jobs", "\tSuccesses: {}", stats.total_steal_successes);
            log::debug!(target: "ember_jobs", "\tSuccess Rate: {:.2}%", stats.steal_success_rate);

            log::debug!(target: "ember_jobs", "Load Balancing:");
            log::debug!(target: "ember_jobs", "\tImbalance Coefficient: {:.2}", stats.load_imbalance);
            log::debug!(target: "ember_jobs", "\t(0.0 = perfect, <0.2 = good, >0.5 = poor)");

            log::debug!(target: "ember_jobs", "Idle:");
            log::debug!(
                target: "ember_jobs",
                "\tTotal: {:.2} ms",
                stats.total_idle_time_ns as f64 / 1e6
            );
            log::debug!(target: "ember_jobs", "\tPercentage: {:.2}%", stats.idle_time_percentage);
            log::debug!(target: "ember_jobs", "\tSpins: {}", stats.total_idle_spins);

            log::debug!(target: "ember_jobs", "Per Thread:");
            for (index, slot) in self.slots.iter().enumerate() {
                let thread = slot.snapshot();
                let label: &dyn core::fmt::Display =
                    if index == self.num_workers() { &"main" } else { &index };
                log::debug!(
                    target: "ember_jobs",
                    "\t[{label}] executed {} / stolen {} / lost {} / attempts {}",
                    thread.jobs_executed,
                    thread.jobs_stolen,
                    thread.jobs_lost_to_thieves,
                    thread.steal_attempts,
                );
            }
        }
        #[cfg(not(feature = "stats"))]
        log::error!(
            target: "ember_jobs",
            "statistics report requested, but the `stats` feature is disabled"
        );
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
#[cfg(feature = "stats")]
mod tests {
    use super::{JobStats, QueueKind};

    use core::time::Duration;

    use crate::worker_queue::Priority;

    #[test]
    fn attribution_per_slot() {
        let stats = JobStats::new(2);
        stats.record_submitted(Some(0), Priority::High, 4);
        stats.record_submitted(Some(1), Priority::Low, 2);
        stats.record_submitted(None, Priority::Normal, 1);
        // Out-of-range ids fall back to the main slot.
        stats.record_submitted(Some(99), Priority::Normal, 1);

        let threads = stats.thread_stats();
        assert_eq!(threads.len(), 3);
        assert_eq!(threads[0].jobs_submitted, 4);
        assert_eq!(threads[1].jobs_submitted, 2);
        assert_eq!(threads[2].jobs_submitted, 2);

        let global = stats.aggregate();
        assert_eq!(global.total_jobs_submitted, 8);
        assert_eq!(global.jobs_by_priority[Priority::High.lane()], 4);
        assert_eq!(global.jobs_by_priority[Priority::Normal.lane()], 2);
        assert_eq!(global.jobs_by_priority[Priority::Low.lane()], 2);
    }

    #[test]
    fn execution_time_extremes() {
        let stats = JobStats::new(1);
        stats.record_executed(Some(0), Duration::from_nanos(500));
        stats.record_executed(Some(0), Duration::from_nanos(1_500));

        let global = stats.aggregate();
        assert_eq!(global.total_jobs_executed, 2);
        assert_eq!(global.min_job_time_ns, 500);
        assert_eq!(global.max_job_time_ns, 1_500);
        assert!((global.average_job_time_us - 1.0).abs() < 1e-9);
    }

    #[test]
    fn steal_rate() {
        let stats = JobStats::new(2);
        stats.record_steal_attempt(Some(0), 0);
        stats.record_steal_attempt(Some(0), 3);
        stats.record_stolen_from(1, 3);

        let global = stats.aggregate();
        assert_eq!(global.total_steal_attempts, 2);
        assert_eq!(global.total_steal_successes, 1);
        assert_eq!(global.total_jobs_stolen, 3);
        assert!((global.steal_success_rate - 50.0).abs() < 1e-9);
        assert_eq!(stats.thread_stats()[1].jobs_lost_to_thieves, 3);
    }

    #[test]
    fn queue_depth_averages() {
        let stats = JobStats::new(1);
        stats.record_queue_depth(Some(0), 4, 0);
        stats.record_queue_depth(Some(0), 8, 2);

        let global = stats.aggregate();
        assert!((global.average_local_queue_depth - 6.0).abs() < 1e-9);
        assert!((global.average_stealable_queue_depth - 1.0).abs() < 1e-9);
        assert_eq!(global.max_queue_depth, 8);
    }

    #[test]
    fn perfectly_balanced_load_has_zero_imbalance() {
        let stats = JobStats::new(3);
        for worker in 0..3 {
            stats.record_executed(Some(worker), Duration::from_nanos(100));
        }
        stats.record_executed(None, Duration::from_nanos(100));

        let global = stats.aggregate();
        assert!(global.load_imbalance.abs() < 1e-9);
    }

    #[test]
    fn reset_yields_zero_snapshot() {
        let stats = JobStats::new(2);
        stats.record_executed(Some(0), Duration::from_nanos(100));
        stats.record_queue_hit(Some(0), QueueKind::Local);
        stats.record_idle_spin(Some(1));
        assert_ne!(stats.aggregate().total_jobs_executed, 0);

        stats.reset();
        let global = stats.aggregate();
        assert_eq!(global.total_jobs_executed, 0);
        assert_eq!(global.min_job_time_ns, 0);
        assert_eq!(global.max_job_time_ns, 0);
        assert_eq!(global.total_idle_spins, 0);
        assert_eq!(global.load_imbalance, 0.0);
        assert_eq!(stats.thread_stats()[0].local_queue_hits, 0);
    }
}
