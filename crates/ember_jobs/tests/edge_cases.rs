mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ember_jobs::{Counter, Job, Priority, Scheduler};

use common::eventually;

// -----------------------------------------------------------------------------
// Capturing logger

static LOGGED_ERRORS: AtomicUsize = AtomicUsize::new(0);

struct CountingLogger;

impl log::Log for CountingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Error
    }

    fn log(&self, record: &log::Record) {
        if record.level() == log::Level::Error && record.target() == "ember_jobs" {
            LOGGED_ERRORS.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {}
}

fn install_logger() {
    static LOGGER: CountingLogger = CountingLogger;
    // Several tests in this binary may race to install; one wins, which is
    // all that matters.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Error);
}

// -----------------------------------------------------------------------------
// Tests

#[test]
fn zero_worker_scheduler_never_steals() {
    let scheduler = Scheduler::create(0);
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = Counter::new();

    let jobs: Vec<Job> = (0..100)
        .map(|_| {
            let executed = Arc::clone(&executed);
            Job::new(async move {
                executed.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    scheduler.dispatch_jobs(jobs, Priority::Normal, Some(&counter));
    scheduler.wait_for_counter(&counter);

    assert_eq!(executed.load(Ordering::Relaxed), 100);

    let global = scheduler.stats().aggregate();
    assert_eq!(global.total_jobs_executed, 100);
    assert_eq!(global.total_steal_attempts, 0);
    assert_eq!(global.total_steal_successes, 0);
}

#[test]
fn panicking_job_still_completes_its_batch() {
    install_logger();
    let before = LOGGED_ERRORS.load(Ordering::Relaxed);

    let scheduler = Scheduler::create(4);
    let executed = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<Job> = (0..5)
        .map(|i| {
            let executed = Arc::clone(&executed);
            Job::new(async move {
                if i == 2 {
                    panic!("job body failure");
                }
                executed.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    // Must return: the failing job's final step still decrements the
    // counter, so the wait cannot hang.
    scheduler.wait_for_jobs(jobs, Priority::Normal);

    assert_eq!(executed.load(Ordering::Relaxed), 4);
    assert!(
        eventually(|| LOGGED_ERRORS.load(Ordering::Relaxed) > before),
        "the swallowed panic must be reported through the logging sink"
    );
}

#[test]
fn dropping_a_scheduler_with_queued_work_does_not_hang() {
    let scheduler = Scheduler::create(2);
    scheduler.dispatch_jobs((0..1_000).map(|_| Job::new(async {})), Priority::Normal, None);
    // Queued-but-never-run handles are destroyed with the scheduler.
    drop(scheduler);
}

#[test]
fn stats_reset_round_trip() {
    let scheduler = Scheduler::create(0);
    scheduler.wait_for_jobs((0..10).map(|_| Job::new(async {})), Priority::High);

    let before = scheduler.stats().aggregate();
    assert_eq!(before.total_jobs_executed, 10);
    assert_eq!(before.total_jobs_submitted, 10);

    scheduler.stats().reset();

    let after = scheduler.stats().aggregate();
    assert_eq!(after.total_jobs_executed, 0);
    assert_eq!(after.total_jobs_submitted, 0);
    assert_eq!(after.total_idle_spins, 0);
    assert_eq!(after.min_job_time_ns, 0);
    assert_eq!(after.max_job_time_ns, 0);
}

#[test]
fn high_priority_batch_drains_before_low() {
    // One driver thread, no workers: dequeue order is observable. Low is
    // dispatched first but High must come out of the pool first.
    let scheduler = Scheduler::create(0);
    let order: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::default();

    for (priority, tag) in [(Priority::Low, "low"), (Priority::High, "high")] {
        let order = Arc::clone(&order);
        scheduler.dispatch_job(
            Job::new(async move {
                order.lock().unwrap().push(tag);
            }),
            priority,
            None,
        );
    }

    while scheduler.main_thread_do_work() != ember_jobs::IterationState::EmptyQueue {}

    assert_eq!(*order.lock().unwrap(), ["high", "low"]);
}
