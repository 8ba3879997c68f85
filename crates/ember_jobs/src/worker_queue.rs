use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::job::JobHandle;

// -----------------------------------------------------------------------------
// Priority

/// Job execution priority.
///
/// Workers always drain high-priority work before normal, and normal before
/// low, within a single queue pair. There is no fairness guarantee beyond
/// that preference, and no ordering guarantee between jobs of the same
/// priority.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    /// Number of priority lanes.
    pub(crate) const COUNT: usize = 3;

    /// Lanes in draining order: high first.
    pub(crate) const DESCENDING: [Priority; Self::COUNT] =
        [Priority::High, Priority::Normal, Priority::Low];

    #[inline(always)]
    pub(crate) const fn lane(self) -> usize {
        self as usize
    }
}

// -----------------------------------------------------------------------------
// PriorityQueues

/// Three MPMC unbounded queues, one per priority lane.
///
/// A handle enqueued at priority `p` is only ever visible through lane `p`.
/// Producers do not coordinate, so there is no cross-producer ordering.
pub(crate) struct PriorityQueues {
    lanes: [SegQueue<JobHandle>; Priority::COUNT],
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self { lanes: [SegQueue::new(), SegQueue::new(), SegQueue::new()] }
    }

    #[inline]
    pub fn enqueue(&self, priority: Priority, handle: JobHandle) {
        self.lanes[priority.lane()].push(handle);
    }

    pub fn enqueue_bulk(&self, priority: Priority, handles: impl IntoIterator<Item = JobHandle>) {
        let lane = &self.lanes[priority.lane()];
        for handle in handles {
            lane.push(handle);
        }
    }

    #[inline]
    pub fn try_dequeue(&self, priority: Priority) -> Option<JobHandle> {
        self.lanes[priority.lane()].pop()
    }

    /// Drains up to `max` handles from one lane into `out`, returning how
    /// many were taken.
    pub fn try_dequeue_bulk(
        &self,
        priority: Priority,
        out: &mut Vec<JobHandle>,
        max: usize,
    ) -> usize {
        let lane = &self.lanes[priority.lane()];
        let mut taken = 0;
        while taken < max {
            let Some(handle) = lane.pop() else { break };
            out.push(handle);
            taken += 1;
        }
        taken
    }
}

// -----------------------------------------------------------------------------
// WorkerQueue

/// One worker's pending work, split into a private-local pool and a
/// stealable pool.
///
/// The owning worker is the only thread that submits to or pops from the
/// local pool; every so often it migrates a slice of backlog into the
/// stealable pool, which is the only surface other workers may touch
/// ([`attempt_steal`](Self::attempt_steal)). The split keeps the hot path
/// contention-free and throttles how much work thieves can fight over.
///
/// Depth counters track the population of each lane in each pool. They are
/// maintained on every insertion and removal, so at quiescence the sum of
/// all six equals the number of handles resident in the pair.
pub(crate) struct WorkerQueue {
    local: PriorityQueues,
    stealable: PriorityQueues,

    local_depth: [AtomicUsize; Priority::COUNT],
    stealable_depth: [AtomicUsize; Priority::COUNT],

    /// Local backlog, per lane, above which migration kicks in.
    migrate_threshold: usize,
    /// Upper bound on handles moved per lane per migration pass.
    migrate_batch: usize,
}

impl WorkerQueue {
    pub fn new(migrate_threshold: usize, migrate_batch: usize) -> Self {
        Self {
            local: PriorityQueues::new(),
            stealable: PriorityQueues::new(),
            local_depth: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            stealable_depth: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            migrate_threshold,
            migrate_batch,
        }
    }

    /// Places one handle in the local pool.
    pub fn submit_local(&self, handle: JobHandle, priority: Priority) {
        self.local.enqueue(priority, handle);
        self.local_depth[priority.lane()].fetch_add(1, Ordering::Relaxed);
    }

    /// Places a batch of handles in the local pool; the depth counter is
    /// raised once by the whole batch size.
    pub fn submit_local_bulk(&self, handles: Vec<JobHandle>, priority: Priority) {
        let count = handles.len();
        if count == 0 {
            return;
        }
        self.local.enqueue_bulk(priority, handles);
        self.local_depth[priority.lane()].fetch_add(count, Ordering::Relaxed);
    }

    /// Drains up to `max` handles from the local pool into `out`, high
    /// priority first. Returns the number taken.
    ///
    /// Once a higher lane has partially filled the budget, the remainder is
    /// filled from lower lanes; strict priority is preserved across calls,
    /// not inside one batch.
    pub fn try_pop_local_bulk(&self, out: &mut Vec<JobHandle>, max: usize) -> usize {
        let mut total = 0;
        for priority in Priority::DESCENDING {
            if total >= max {
                break;
            }
            let taken = self.local.try_dequeue_bulk(priority, out, max - total);
            if taken > 0 {
                self.local_depth[priority.lane()].fetch_sub(taken, Ordering::Relaxed);
                total += taken;
            }
        }
        total
    }

    /// Moves a slice of local backlog into the stealable pool.
    ///
    /// For each lane whose local depth exceeds the threshold, up to
    /// `migrate_batch` handles are re-enqueued at the same priority. The
    /// local depth drop is published before the stealable depth rise, so a
    /// thief that sees the new depth also sees the handles.
    pub fn migrate_to_stealable(&self) {
        let mut moved: Vec<JobHandle> = Vec::new();

        for priority in Priority::DESCENDING {
            let lane = priority.lane();
            if self.local_depth[lane].load(Ordering::Relaxed) <= self.migrate_threshold {
                continue;
            }

            let count = self.local.try_dequeue_bulk(priority, &mut moved, self.migrate_batch);
            if count == 0 {
                continue;
            }

            self.local_depth[lane].fetch_sub(count, Ordering::Relaxed);
            self.stealable.enqueue_bulk(priority, moved.drain(..));
            self.stealable_depth[lane].fetch_add(count, Ordering::Release);
        }
    }

    /// Takes up to `max` handles from the stealable pool into `out`, high
    /// priority first. Returns the number stolen.
    ///
    /// This is the only method on a `WorkerQueue` that threads other than
    /// the owner may call.
    pub fn attempt_steal(&self, out: &mut Vec<JobHandle>, max: usize) -> usize {
        let mut total = 0;
        for priority in Priority::DESCENDING {
            if total >= max {
                break;
            }
            let lane = priority.lane();
            if self.stealable_depth[lane].load(Ordering::Acquire) == 0 {
                continue;
            }

            let taken = self.stealable.try_dequeue_bulk(priority, out, max - total);
            if taken > 0 {
                self.stealable_depth[lane].fetch_sub(taken, Ordering::Relaxed);
                total += taken;
            }
        }
        total
    }

    /// Instantaneous local population across all lanes. Sampling only.
    pub fn local_depth_total(&self) -> usize {
        self.local_depth.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }

    /// Instantaneous stealable population across all lanes. Sampling only.
    pub fn stealable_depth_total(&self) -> usize {
        self.stealable_depth.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }
}

// -----------------------------------------------------------------------------
// Tests
