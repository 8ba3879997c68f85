mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use ember_jobs::{Counter, Job, Priority, Scheduler};

use common::eventually;

fn counting_jobs(n: usize, executed: &Arc<AtomicUsize>) -> Vec<Job> {
    (0..n)
        .map(|_| {
            let executed = Arc::clone(executed);
            Job::new(async move {
                executed.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect()
}

#[test]
fn a_thousand_jobs_across_four_workers() {
    let scheduler = Scheduler::create(4);
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = Counter::new();

    scheduler.dispatch_jobs(counting_jobs(1_000, &executed), Priority::Normal, Some(&counter));
    scheduler.wait_for_counter(&counter);

    assert_eq!(executed.load(Ordering::Relaxed), 1_000);
    assert_eq!(counter.count(), 0);

    assert!(eventually(|| scheduler.stats().aggregate().total_jobs_executed == 1_000));

    // Every execution is attributed to exactly one thread slot.
    let per_thread: u64 = scheduler.stats().thread_stats().iter().map(|t| t.jobs_executed).sum();
    assert_eq!(per_thread, 1_000);

    let imbalance = scheduler.stats().aggregate().load_imbalance;
    assert!(imbalance.is_finite() && imbalance >= 0.0);
}

#[test]
fn parallel_dispatch_of_two_priorities() {
    let scheduler = Scheduler::create(4);
    let executed = Arc::new(AtomicUsize::new(0));

    let high = Counter::new();
    let low = Counter::new();

    thread::scope(|scope| {
        let high_jobs = counting_jobs(10_000, &executed);
        let low_jobs = counting_jobs(10_000, &executed);

        let scheduler = &scheduler;
        let high = &high;
        let low = &low;

        scope.spawn(move || {
            scheduler.dispatch_jobs(high_jobs, Priority::High, Some(high));
        });
        scope.spawn(move || {
            scheduler.dispatch_jobs(low_jobs, Priority::Low, Some(low));
        });
    });

    scheduler.wait_for_counter(&high);
    scheduler.wait_for_counter(&low);

    assert_eq!(executed.load(Ordering::Relaxed), 20_000);
    assert!(eventually(|| scheduler.stats().aggregate().total_jobs_executed == 20_000));

    let global = scheduler.stats().aggregate();
    assert_eq!(global.jobs_by_priority[Priority::High as usize], 10_000);
    assert_eq!(global.jobs_by_priority[Priority::Low as usize], 10_000);
}

#[test]
fn worker_fan_out_is_stolen() {
    let scheduler = Arc::new(Scheduler::create(4));
    let executed = Arc::new(AtomicUsize::new(0));
    let children = Counter::new();

    // The parent runs on a worker, so its batch lands in that worker's
    // local queue; migration then publishes backlog for the other three
    // workers (and the waiting main thread) to steal.
    let parent = {
        let scheduler = Arc::clone(&scheduler);
        let executed = Arc::clone(&executed);
        let children = children.clone();
        Job::new(async move {
            let batch = counting_jobs(10_000, &executed);
            scheduler.dispatch_jobs(batch, Priority::Normal, Some(&children));
        })
    };
    scheduler.dispatch_job(parent, Priority::Normal, None);

    // Stay off the scheduler until the fan-out happened, so the parent is
    // guaranteed to have been picked up by a worker rather than by us.
    while children.count() == 0 {
        thread::yield_now();
    }
    scheduler.wait_for_counter(&children);

    assert_eq!(executed.load(Ordering::Relaxed), 10_000);

    let stats = scheduler.stats();
    assert!(eventually(|| stats.aggregate().total_jobs_executed == 10_001));
    let global = stats.aggregate();
    assert!(global.total_steal_attempts > 0);
    assert!(global.total_steal_successes >= 1, "a 10000-job backlog must get stolen from");
    assert_eq!(global.total_jobs_stolen, stats.thread_stats().iter().map(|t| t.jobs_lost_to_thieves).sum::<u64>());
}

#[test]
fn waiting_from_several_threads_at_once() {
    let scheduler = Scheduler::create(2);
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = Counter::new();

    scheduler.dispatch_jobs(counting_jobs(2_000, &executed), Priority::Normal, Some(&counter));

    thread::scope(|scope| {
        for _ in 0..3 {
            let scheduler = &scheduler;
            let counter = counter.clone();
            scope.spawn(move || scheduler.wait_for_counter(&counter));
        }
    });

    assert_eq!(executed.load(Ordering::Relaxed), 2_000);
    assert_eq!(counter.count(), 0);
}
