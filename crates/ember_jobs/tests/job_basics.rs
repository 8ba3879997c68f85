mod common;

use std::sync::{Arc, Mutex};

use ember_jobs::{Counter, Job, Priority, Scheduler, Task, yield_now};

use common::{ExecutionTracker, eventually};

#[test]
fn yielding_job_is_resumed_once_per_suspension() {
    let scheduler = Scheduler::create(2);
    let tracker = Arc::new(ExecutionTracker::default());
    let counter = Counter::new();

    let job = {
        let tracker = Arc::clone(&tracker);
        Job::new(async move {
            tracker.record("segment 0");
            yield_now().await;
            tracker.record("segment 1");
            yield_now().await;
            tracker.record("segment 2");
            yield_now().await;
            tracker.record("segment 3");
        })
    };

    scheduler.dispatch_job(job, Priority::Normal, Some(&counter));
    scheduler.wait_for_counter(&counter);

    // The counter was decremented exactly once, by the final step.
    assert_eq!(counter.count(), 0);

    // Three yields plus completion: four segments ran, in order.
    assert_eq!(tracker.execution_count(), 4);
    assert!(tracker.executed_before("segment 0", "segment 1"));
    assert!(tracker.executed_before("segment 1", "segment 2"));
    assert!(tracker.executed_before("segment 2", "segment 3"));

    // Each resume is one recorded execution: the initial one plus one per
    // yield. Nothing else ran on this scheduler.
    assert!(eventually(|| scheduler.stats().aggregate().total_jobs_executed == 4));
}

#[test]
fn jobs_collect_task_results() {
    let scheduler = Scheduler::create(4);
    let results: Arc<Mutex<Vec<i32>>> = Arc::default();

    let jobs: Vec<Job> = (0..4)
        .map(|i| {
            let results = Arc::clone(&results);
            Job::new(async move {
                let value = Task::new(async move { i }).await;
                results.lock().unwrap().push(value);
            })
        })
        .collect();

    scheduler.wait_for_jobs(jobs, Priority::Normal);

    let mut results = results.lock().unwrap();
    results.sort_unstable();
    assert_eq!(*results, [0, 1, 2, 3]);
}

#[test]
fn task_chain_runs_inside_a_job_in_call_order() {
    let scheduler = Scheduler::create(2);
    let tracker = Arc::new(ExecutionTracker::default());

    let job = {
        let tracker = Arc::clone(&tracker);
        Job::new(async move {
            tracker.record("job start");

            let inner = {
                let tracker = Arc::clone(&tracker);
                Task::new(async move {
                    tracker.record("task");
                    "value"
                })
            };

            let result = inner.await;
            tracker.record(format!("got {result}"));
        })
    };

    scheduler.wait_for_job(job, Priority::High);

    assert!(tracker.executed_before("job start", "task"));
    assert!(tracker.executed_before("task", "got value"));
    assert_eq!(tracker.execution_count(), 3);
}

#[test]
fn finished_counter_waits_return_immediately() {
    let scheduler = Scheduler::create(2);
    let counter = Counter::new();

    scheduler.dispatch_jobs(
        (0..32).map(|_| Job::new(async {})),
        Priority::Normal,
        Some(&counter),
    );
    scheduler.wait_for_counter(&counter);
    assert_eq!(counter.count(), 0);

    // Waiting again on the drained counter must not block.
    scheduler.wait_for_counter(&counter);
    assert_eq!(counter.count(), 0);
}

#[test]
fn one_counter_can_track_several_batches() {
    let scheduler = Scheduler::create(2);
    let counter = Counter::new();

    for _ in 0..3 {
        scheduler.dispatch_jobs(
            (0..16).map(|_| Job::new(async { yield_now().await })),
            Priority::Low,
            Some(&counter),
        );
        scheduler.wait_for_counter(&counter);
        assert_eq!(counter.count(), 0);
    }
}
