//! Multi-queue, work-stealing, cooperatively-scheduled job system.
//!
//! The scheduler runs suspendable units of work ([`Job`]s) across a pool of
//! worker threads. Each worker owns a pair of priority queue sets — a
//! private local pool and a stealable pool fed by periodic migration — and
//! falls back to stealing from random victims and to a global pool serving
//! non-worker dispatchers. Synchronization between dispatchers and the pool
//! is explicit through [`Counter`]s, and per-thread [`JobStats`] describe
//! how well the load spreads.
//!
//! Jobs suspend only at declared points: a voluntary [`yield_now`], awaiting
//! a [`Task`], or completion. There is no preemption, no FIFO guarantee
//! within a priority, and no affinity for resumed jobs.
//!
//! ```
//! use ember_jobs::{Job, Priority, Scheduler};
//!
//! let scheduler = Scheduler::create(2);
//! scheduler.wait_for_jobs(
//!     (0..64).map(|_| Job::new(async {})),
//!     Priority::Normal,
//! );
//! ```

// -----------------------------------------------------------------------------
// Modules

mod counter;
mod job;
mod scheduler;
mod stats;
mod task;
mod worker_queue;
mod xor_shift;

// -----------------------------------------------------------------------------
// Exports

pub use counter::Counter;
pub use job::{Job, YieldNow, yield_now};
pub use scheduler::{IterationState, Scheduler, SchedulerBuilder};
pub use stats::{GlobalStats, JobStats, ThreadStats};
pub use task::{Task, execute};
pub use worker_queue::Priority;
