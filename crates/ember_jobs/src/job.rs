use core::future::Future;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll};

use futures_lite::FutureExt;

use crate::counter::Counter;

// -----------------------------------------------------------------------------
// JobHandle

/// Handle to a dispatched, currently suspended job.
///
/// This is the token that flows through the scheduler's queues: pointer
/// sized, trivially movable, and unique. Running it resumes the job until
/// its next suspension point or completion; `async-task` destroys the frame
/// once the job has completed, so a handle can never outlive the frame it
/// refers to, and no two threads can resume the same job concurrently.
pub(crate) type JobHandle = async_task::Runnable<JobMeta>;

// -----------------------------------------------------------------------------
// JobMeta

/// Per-job state attached to the frame at dispatch time.
pub(crate) struct JobMeta {
    /// Counter tracking this job's completion, if it was dispatched with one.
    ///
    /// The clone held here is what keeps the counter state alive until the
    /// final step has run.
    pub counter: Option<Counter>,
}

// -----------------------------------------------------------------------------
// Job

/// A suspendable unit of work with no return value.
///
/// A job wraps an async body that has not started executing: construction
/// never runs any of it, and nothing will until the job is dispatched to a
/// [`Scheduler`] and a worker resumes it. Inside the body, [`yield_now`]
/// suspends cooperatively and [`Task`](crate::Task)s compose sub-work with
/// results.
///
/// ```
/// use ember_jobs::Job;
///
/// let job = Job::new(async {
///     // Not running yet; a worker thread will execute this after dispatch.
/// });
/// # drop(job);
/// ```
///
/// [`Scheduler`]: crate::Scheduler
#[must_use = "a job does nothing until it is dispatched"]
pub struct Job {
    body: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
}

impl Job {
    /// Wraps `body` as a dispatchable job. The body is not polled here.
    pub fn new(body: impl Future<Output = ()> + Send + 'static) -> Self {
        Self { body: Box::pin(body) }
    }

    /// Converts the job into a runnable handle, binding the counter and the
    /// scheduler's re-queue hook. The handle still has to be enqueued by the
    /// caller; nothing runs until then.
    pub(crate) fn into_handle<S>(self, counter: Option<Counter>, schedule: S) -> JobHandle
    where
        S: Fn(JobHandle) + Send + Sync + 'static,
    {
        let body = self.body;
        let (handle, task) = async_task::Builder::new()
            .metadata(JobMeta { counter })
            .spawn(move |meta: &JobMeta| frame(body, meta.counter.clone()), schedule);

        // Fire-and-forget: the handle in the queues is the only owner that
        // matters, and completion is observed through the counter.
        task.detach();
        handle
    }
}

impl core::fmt::Debug for Job {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Job")
    }
}

/// The outermost frame of every job: user body, then the final step.
///
/// A panic in the body is contained here and reported through the logging
/// sink; it must never leak past the suspension boundary, and in particular
/// it must not skip the counter decrement, or waiters would sleep forever.
async fn frame(body: Pin<Box<dyn Future<Output = ()> + Send + 'static>>, counter: Option<Counter>) {
    if AssertUnwindSafe(body).catch_unwind().await.is_err() {
        log::error!(target: "ember_jobs", "unhandled panic in job body");
    }

    if let Some(counter) = counter {
        counter.complete_one();
    }
}

// -----------------------------------------------------------------------------
// yield_now

/// Voluntarily suspends the current job.
///
/// The suspending job is re-enqueued on the current worker's local queue at
/// normal priority, waiters parked on the job's counter are woken so another
/// thread can pick the work up, and the worker immediately continues with
/// the next cached job. Resumption may happen on any worker.
///
/// Outside a job body this is a plain cooperative yield towards whatever
/// executor is polling the future.
#[inline]
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }

        self.yielded = true;
        // The wake is deferred by async-task until this poll has fully
        // returned, which is what makes the re-enqueue safe: nobody can
        // resume a job that is still on some thread's stack.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

// -----------------------------------------------------------------------------
// Tests
