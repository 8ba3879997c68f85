use core::cell::RefCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use std::sync::Arc;
use std::thread::{self, JoinHandle};
#[cfg(feature = "stats")]
use std::time::Instant;

use crossbeam_utils::CachePadded;

use crate::counter::Counter;
use crate::job::{Job, JobHandle};
use crate::stats::{JobStats, QueueKind};
use crate::worker_queue::{Priority, WorkerQueue};
use crate::xor_shift::XorShift64Star;

// -----------------------------------------------------------------------------
// Config

/// Iterations between checks for migrating local backlog to the stealable
/// pool.
const STEAL_CHECK_INTERVAL: u32 = 32;

/// Iterations between queue-depth samples.
const SAMPLE_INTERVAL: u32 = 64;

/// Default capacity of the per-thread job cache.
const DEFAULT_JOB_CACHE_SIZE: usize = 32;

/// Default local backlog, per priority lane, above which migration kicks in.
const DEFAULT_MIGRATE_THRESHOLD: usize = 32;

/// Default upper bound on jobs migrated per lane per pass.
const DEFAULT_MIGRATE_BATCH: usize = 16;

// -----------------------------------------------------------------------------
// IterationState

/// Outcome of one pass through the worker loop body.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IterationState {
    /// A cached job was resumed.
    Executed,
    /// The job cache was refilled from some queue; nothing ran yet.
    FilledCache,
    /// No runnable work was found anywhere.
    EmptyQueue,
}

// -----------------------------------------------------------------------------
// WorkerContext

/// Shared, thief-visible side of one worker: its queue pair.
///
/// The single-writer side (job cache, PRNG, interval counters) lives in
/// thread-local storage instead, so that a job which re-enters the scheduler
/// mid-execution never aliases it.
struct WorkerContext {
    queue: WorkerQueue,
}

impl WorkerContext {
    fn new(migrate_threshold: usize, migrate_batch: usize) -> Self {
        Self { queue: WorkerQueue::new(migrate_threshold, migrate_batch) }
    }
}

// -----------------------------------------------------------------------------
// ThreadContext

/// Per-thread scheduler state, bound to a scheduler on worker startup.
///
/// Threads that never bind (the main thread, external callers) use the
/// global context for submissions but still keep their own cache and PRNG
/// here, so waiting and stealing work from any thread without locks.
struct ThreadContext {
    /// Identity of the scheduler this thread is a worker of. Compared, never
    /// dereferenced; null while unbound.
    scheduler: *const State,
    /// Worker index within the owning scheduler's context array.
    index: usize,
    rng: XorShift64Star,
    /// Staging area for bulk dequeues, drained from the back.
    job_cache: Vec<JobHandle>,
    iterations_since_steal_check: u32,
    iterations_since_sample: u32,
}

impl ThreadContext {
    const fn unbound() -> Self {
        Self {
            scheduler: ptr::null(),
            index: usize::MAX,
            rng: XorShift64Star::unseeded(),
            job_cache: Vec::new(),
            iterations_since_steal_check: 0,
            iterations_since_sample: 0,
        }
    }

    fn bind(&mut self, state: &State, index: usize) {
        debug_assert!(self.scheduler.is_null(), "thread is already a worker of some scheduler");
        self.scheduler = ptr::from_ref(state);
        self.index = index;
        self.rng.reseed();
        self.job_cache.reserve(state.job_cache_size);
    }

    /// This thread's worker index, if it is a worker of `state`.
    #[inline]
    fn worker_index(&self, state: &State) -> Option<usize> {
        ptr::eq(self.scheduler, ptr::from_ref(state)).then_some(self.index)
    }
}

thread_local! {
    static THREAD_CONTEXT: RefCell<ThreadContext> = const { RefCell::new(ThreadContext::unbound()) };
}

// -----------------------------------------------------------------------------
// State

/// Shared scheduler state; workers hold it through an `Arc` for the life of
/// their loop.
struct State {
    contexts: Box<[CachePadded<WorkerContext>]>,
    /// Context serving dispatches and waits from non-worker threads.
    global_context: CachePadded<WorkerContext>,
    stats: JobStats,
    stop: AtomicBool,
    job_cache_size: usize,
}

impl State {
    #[inline]
    fn num_workers(&self) -> usize {
        self.contexts.len()
    }

    #[inline]
    fn current_worker(&self) -> Option<usize> {
        THREAD_CONTEXT.with(|tc| tc.borrow().worker_index(self))
    }

    #[inline]
    fn context(&self, worker: Option<usize>) -> &WorkerContext {
        match worker {
            Some(index) => &self.contexts[index],
            None => &self.global_context,
        }
    }

    /// Re-queue hook for suspended jobs.
    ///
    /// The handle is fully suspended by the time this runs. It goes back
    /// into the current thread's context at normal priority with no fresh
    /// counter attribution (its completion is already accounted for), and
    /// waiters parked on the job's counter are woken so the re-queued work
    /// cannot be slept past.
    fn requeue(&self, handle: JobHandle) {
        let counter = handle.metadata().counter.clone();

        let worker = self.current_worker();
        self.context(worker).queue.submit_local(handle, Priority::Normal);
        self.stats.record_submitted(worker, Priority::Normal, 1);

        if let Some(counter) = counter {
            counter.unblock();
        }
    }

    /// Refills the calling thread's (empty) job cache through `fill`.
    ///
    /// Queues hand the highest priority out first, while the cache drains
    /// from the back; the batch is flipped so the top of the cache is the
    /// most urgent handle.
    fn refill_cache(&self, fill: impl FnOnce(&mut Vec<JobHandle>, usize) -> usize) -> usize {
        THREAD_CONTEXT.with(|tc| {
            let tc = &mut *tc.borrow_mut();
            debug_assert!(tc.job_cache.is_empty(), "cache refilled while still holding work");
            let filled = fill(&mut tc.job_cache, self.job_cache_size);
            tc.job_cache.reverse();
            filled
        })
    }

    /// One pass of the scheduling loop: drain the cache, refill it from the
    /// cheapest source available, or report that everything is empty.
    fn worker_iteration(&self) -> IterationState {
        // Cache drain. The borrow is released before the job runs so the
        // body may re-enter the scheduler freely.
        let cached = THREAD_CONTEXT.with(|tc| tc.borrow_mut().job_cache.pop());
        if let Some(handle) = cached {
            self.execute_job(handle);
            return IterationState::Executed;
        }

        let worker = self.current_worker();

        // Local refill, workers only: every STEAL_CHECK_INTERVAL passes,
        // publish a slice of backlog to thieves first.
        if let Some(index) = worker {
            let migrate = THREAD_CONTEXT.with(|tc| {
                let tc = &mut *tc.borrow_mut();
                tc.iterations_since_steal_check += 1;
                if tc.iterations_since_steal_check >= STEAL_CHECK_INTERVAL {
                    tc.iterations_since_steal_check = 0;
                    true
                } else {
                    false
                }
            });

            let queue = &self.contexts[index].queue;
            if migrate {
                queue.migrate_to_stealable();
            }

            let filled = self.refill_cache(|cache, max| queue.try_pop_local_bulk(cache, max));
            if filled > 0 {
                self.stats.record_queue_hit(worker, QueueKind::Local);
                return IterationState::FilledCache;
            }
        }

        #[cfg(feature = "stats")]
        {
            let sample = THREAD_CONTEXT.with(|tc| {
                let tc = &mut *tc.borrow_mut();
                tc.iterations_since_sample += 1;
                if tc.iterations_since_sample >= SAMPLE_INTERVAL {
                    tc.iterations_since_sample = 0;
                    true
                } else {
                    false
                }
            });
            if sample {
                let queue = &self.context(worker).queue;
                self.stats.record_queue_depth(
                    worker,
                    queue.local_depth_total() as u64,
                    queue.stealable_depth_total() as u64,
                );
            }
        }

        let stolen = self.try_steal(worker);
        if stolen > 0 {
            self.stats.record_queue_hit(worker, QueueKind::Stealable);
            return IterationState::FilledCache;
        }

        // The pool fed by non-worker dispatches.
        let filled = self
            .refill_cache(|cache, max| self.global_context.queue.try_pop_local_bulk(cache, max));
        if filled > 0 {
            self.stats.record_queue_hit(worker, QueueKind::Global);
            return IterationState::FilledCache;
        }

        // Last resort for an otherwise idle worker: reclaim its own
        // stealable pool. Published work that no thief ever takes must not
        // strand there while its owner spins empty-handed.
        if let Some(index) = worker {
            let reclaimed = self
                .refill_cache(|cache, max| self.contexts[index].queue.attempt_steal(cache, max));
            if reclaimed > 0 {
                self.stats.record_queue_hit(worker, QueueKind::Stealable);
                return IterationState::FilledCache;
            }
        }

        IterationState::EmptyQueue
    }

    /// Returns handles staged in this thread's cache to the global pool.
    ///
    /// A non-worker thread may stop interacting with the scheduler at any
    /// time; work it staged but did not run must not be stranded with it.
    fn flush_thread_cache(&self) {
        loop {
            let Some(handle) = THREAD_CONTEXT.with(|tc| tc.borrow_mut().job_cache.pop()) else {
                break;
            };
            // Same path as a suspension: re-publish, then wake any waiter
            // parked on the handle's counter so the work is picked up.
            self.requeue(handle);
        }
    }

    /// Steals from one uniformly random victim into the thread's cache.
    fn try_steal(&self, thief: Option<usize>) -> usize {
        if self.num_workers() == 0 {
            return 0;
        }

        let victim =
            THREAD_CONTEXT.with(|tc| tc.borrow_mut().rng.next_bounded(self.num_workers()));
        if Some(victim) == thief {
            // A self-pick counts as a failed attempt; no retry this pass.
            self.stats.record_steal_attempt(thief, 0);
            return 0;
        }

        let stolen = self
            .refill_cache(|cache, max| self.contexts[victim].queue.attempt_steal(cache, max));

        self.stats.record_steal_attempt(thief, stolen as u64);
        if stolen > 0 {
            self.stats.record_stolen_from(victim, stolen as u64);
        }
        stolen
    }

    /// Resumes one job until its next suspension point or completion.
    fn execute_job(&self, handle: JobHandle) {
        #[cfg(feature = "stats")]
        let start = Instant::now();

        handle.run();

        #[cfg(feature = "stats")]
        self.stats.record_executed(self.current_worker(), start.elapsed());
    }
}

// -----------------------------------------------------------------------------
// Worker loop

fn worker_thread_loop(state: Arc<State>, index: usize) {
    THREAD_CONTEXT.with(|tc| tc.borrow_mut().bind(&state, index));
    log::trace!(target: "ember_jobs", "worker {index} started");

    while !state.stop.load(Ordering::Acquire) {
        if state.worker_iteration() == IterationState::EmptyQueue {
            state.stats.record_idle_spin(Some(index));
            #[cfg(feature = "stats")]
            let idle_start = Instant::now();

            thread::yield_now();

            #[cfg(feature = "stats")]
            state.stats.record_idle_time(Some(index), idle_start.elapsed());
        }
    }

    log::trace!(target: "ember_jobs", "worker {index} stopped");
}

// -----------------------------------------------------------------------------
// SchedulerBuilder

/// Builder for a [`Scheduler`].
///
/// ```
/// use ember_jobs::SchedulerBuilder;
///
/// let scheduler = SchedulerBuilder::new()
///     .worker_threads(2)
///     .thread_name(String::from("render-jobs"))
///     .build();
/// assert_eq!(scheduler.num_workers(), 2);
/// ```
#[must_use]
pub struct SchedulerBuilder {
    /// Worker count. `None` uses the logical core count; negative values
    /// count backwards from it.
    worker_threads: Option<i32>,
    job_cache_size: usize,
    thread_name: Option<String>,
    stack_size: Option<usize>,
    migrate_threshold: usize,
    migrate_batch: usize,
}

impl SchedulerBuilder {
    pub const fn new() -> Self {
        Self {
            worker_threads: None,
            job_cache_size: DEFAULT_JOB_CACHE_SIZE,
            thread_name: None,
            stack_size: None,
            migrate_threshold: DEFAULT_MIGRATE_THRESHOLD,
            migrate_batch: DEFAULT_MIGRATE_BATCH,
        }
    }

    /// Number of worker threads.
    ///
    /// - `n > 0`: exactly that many workers.
    /// - `n == 0`: no workers; the caller drives everything through
    ///   [`Scheduler::main_thread_do_work`] or the wait calls.
    /// - `n < 0`: logical core count plus `n`, clamped at zero.
    #[inline]
    pub fn worker_threads(mut self, n: i32) -> Self {
        self.worker_threads = Some(n);
        self
    }

    /// Capacity of the per-thread staging cache for bulk dequeues.
    #[inline]
    pub fn job_cache_size(mut self, size: usize) -> Self {
        debug_assert!(size > 0, "a zero-size job cache cannot hold work");
        self.job_cache_size = size;
        self
    }

    /// Thread name prefix; workers are named `"{prefix} ({index})"`.
    #[inline]
    pub fn thread_name(mut self, name: String) -> Self {
        self.thread_name = Some(name);
        self
    }

    /// Stack size for worker threads. System default if unset.
    #[inline]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Local backlog, per priority lane, a worker keeps to itself before
    /// publishing work for thieves.
    #[inline]
    pub fn migrate_threshold(mut self, jobs: usize) -> Self {
        self.migrate_threshold = jobs;
        self
    }

    /// Upper bound on jobs moved per lane each migration pass.
    #[inline]
    pub fn migrate_batch(mut self, jobs: usize) -> Self {
        self.migrate_batch = jobs;
        self
    }

    /// Builds the scheduler and starts its worker threads.
    pub fn build(self) -> Scheduler {
        let num_workers = resolve_worker_count(self.worker_threads);
        log::info!(target: "ember_jobs", "initializing scheduler with {num_workers} worker threads");

        let state = Arc::new(State {
            contexts: (0..num_workers)
                .map(|_| {
                    CachePadded::new(WorkerContext::new(self.migrate_threshold, self.migrate_batch))
                })
                .collect(),
            global_context: CachePadded::new(WorkerContext::new(
                self.migrate_threshold,
                self.migrate_batch,
            )),
            stats: JobStats::new(num_workers),
            stop: AtomicBool::new(false),
            job_cache_size: self.job_cache_size,
        });

        let prefix = self.thread_name.as_deref().unwrap_or("ember-worker");
        let threads: Box<[JoinHandle<()>]> = (0..num_workers)
            .map(|index| {
                let state = Arc::clone(&state);

                let mut builder = thread::Builder::new().name(format!("{prefix} ({index})"));
                if let Some(stack_size) = self.stack_size {
                    builder = builder.stack_size(stack_size);
                }

                builder
                    .spawn(move || worker_thread_loop(state, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Scheduler { state, threads }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_worker_count(requested: Option<i32>) -> usize {
    let available = thread::available_parallelism().map_or(1, core::num::NonZeroUsize::get);
    match requested {
        None => available,
        Some(n) if n >= 0 => n as usize,
        Some(n) => available.saturating_sub(n.unsigned_abs() as usize),
    }
}

// -----------------------------------------------------------------------------
// Scheduler

/// Multi-queue work-stealing job scheduler.
///
/// Owns a pool of worker threads, one queue pair per worker, and a global
/// context for work dispatched from non-worker threads. Jobs are suspendable
/// and cooperatively scheduled: they run until they yield, await, or finish,
/// and a suspended job may be resumed by any worker.
///
/// ```
/// use ember_jobs::{Counter, Job, Priority, Scheduler};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let scheduler = Scheduler::create(2);
/// let done = Arc::new(AtomicUsize::new(0));
/// let counter = Counter::new();
///
/// let jobs: Vec<Job> = (0..16)
///     .map(|_| {
///         let done = Arc::clone(&done);
///         Job::new(async move {
///             done.fetch_add(1, Ordering::Relaxed);
///         })
///     })
///     .collect();
///
/// scheduler.dispatch_jobs(jobs, Priority::Normal, Some(&counter));
/// scheduler.wait_for_counter(&counter);
///
/// assert_eq!(done.load(Ordering::Relaxed), 16);
/// ```
pub struct Scheduler {
    state: Arc<State>,
    threads: Box<[JoinHandle<()>]>,
}

impl Scheduler {
    /// Creates a scheduler with default tuning and the given worker count
    /// (see [`SchedulerBuilder::worker_threads`] for the sign convention).
    pub fn create(num_worker_threads: i32) -> Self {
        SchedulerBuilder::new().worker_threads(num_worker_threads).build()
    }

    /// A builder for non-default tuning.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Number of worker threads in the pool.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.state.num_workers()
    }

    /// Scheduler statistics.
    #[inline]
    pub fn stats(&self) -> &JobStats {
        &self.state.stats
    }

    /// Makes one job runnable.
    pub fn dispatch_job(&self, job: Job, priority: Priority, counter: Option<&Counter>) {
        self.dispatch_jobs([job], priority, counter);
    }

    /// Makes a batch of jobs runnable.
    ///
    /// Every job is attributed to `counter` (if given), whose count is
    /// raised by the batch size before any handle is published, so a waiter
    /// can never observe the batch under-counted. The batch lands on the
    /// calling thread's context: a worker keeps it local until migration,
    /// any other thread feeds the global pool. An empty batch is a no-op.
    pub fn dispatch_jobs(
        &self,
        jobs: impl IntoIterator<Item = Job>,
        priority: Priority,
        counter: Option<&Counter>,
    ) {
        let handles: Vec<JobHandle> = jobs
            .into_iter()
            .map(|job| {
                let state = Arc::downgrade(&self.state);
                job.into_handle(counter.cloned(), move |handle| {
                    // With the scheduler gone there is nowhere to put the
                    // handle; dropping it cancels the job.
                    if let Some(state) = state.upgrade() {
                        state.requeue(handle);
                    }
                })
            })
            .collect();

        if handles.is_empty() {
            return;
        }
        let count = handles.len();

        if let Some(counter) = counter {
            counter.add(count);
        }

        let worker = self.state.current_worker();
        self.state.context(worker).queue.submit_local_bulk(handles, priority);
        self.state.stats.record_submitted(worker, priority, count as u64);

        if let Some(counter) = counter {
            // Threads already parked on this counter must come back and
            // help with the batch that was just published.
            counter.unblock();
        }
    }

    /// Dispatches one job and blocks until it has completed.
    pub fn wait_for_job(&self, job: Job, priority: Priority) {
        self.wait_for_jobs([job], priority);
    }

    /// Dispatches a batch and blocks until every job in it has completed.
    pub fn wait_for_jobs(&self, jobs: impl IntoIterator<Item = Job>, priority: Priority) {
        let counter = Counter::new();
        self.dispatch_jobs(jobs, priority, Some(&counter));
        self.wait_for_counter(&counter);
    }

    /// Blocks until `counter` reaches zero, helping to drain the system
    /// while it waits.
    ///
    /// Callable from worker threads (the worker keeps executing jobs) and
    /// from non-worker threads (which drive the global context). The thread
    /// only parks after announcing it on the counter's blocking flag and
    /// re-checking the count, so a final step can never slip through
    /// unnoticed.
    pub fn wait_for_counter(&self, counter: &Counter) {
        while counter.count() > 0 {
            let iteration = self.state.worker_iteration();

            if iteration == IterationState::EmptyQueue {
                #[cfg(feature = "stats")]
                let idle_start = Instant::now();

                counter.begin_blocking();
                if counter.count() > 0 {
                    counter.park();
                } else {
                    counter.cancel_blocking();
                }

                #[cfg(feature = "stats")]
                self.state
                    .stats
                    .record_idle_time(self.state.current_worker(), idle_start.elapsed());
            }
        }

        // A worker's cache keeps draining in its own loop; a non-worker
        // thread may never come back, so anything it staged goes back to
        // the global pool.
        if self.state.current_worker().is_none() {
            self.state.flush_thread_cache();
        }
    }

    /// Runs one scheduling iteration on the calling thread's context.
    ///
    /// This is how a main thread shares scheduling work without committing
    /// to a blocking wait.
    pub fn main_thread_do_work(&self) -> IterationState {
        self.state.worker_iteration()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Release);

        let panicking = thread::panicking();
        let threads = mem::replace(&mut self.threads, Box::new([]));
        for handle in threads {
            let result = handle.join();
            if !panicking {
                result.expect("worker thread panicked");
            }
        }
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler").field("num_workers", &self.num_workers()).finish()
    }
}

// -----------------------------------------------------------------------------
// Tests
