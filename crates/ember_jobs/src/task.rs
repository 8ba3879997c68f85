use core::future::Future;
use core::mem;
use core::pin::Pin;
use core::task::{Context, Poll};

// -----------------------------------------------------------------------------
// Task

/// A suspendable unit of work with a return value.
///
/// Where a [`Job`](crate::Job) is fire-and-forget, a `Task` is meant to be
/// awaited: a job (or another task) awaits it, control transfers into the
/// task body, and when the body finishes the stored result is moved out to
/// the awaiting frame. An already-finished task ([`Task::ready`]) completes
/// immediately without suspending the caller.
///
/// Tasks own their body by value, so a task cannot be awaited twice — and
/// cannot await itself; cycles are unrepresentable rather than deadlocking.
///
/// ```
/// use ember_jobs::{Task, execute};
///
/// fn double(value: i32) -> Task<i32> {
///     Task::new(async move { value * 2 })
/// }
///
/// let outer = Task::new(async {
///     let a = double(3).await;
///     let b = double(4).await;
///     a + b
/// });
///
/// assert_eq!(execute(outer), 14);
/// ```
#[must_use = "tasks do nothing unless awaited"]
pub struct Task<R> {
    state: State<R>,
}

enum State<R> {
    /// Body not yet finished; polled in place by the awaiting frame.
    Running(Pin<Box<dyn Future<Output = R> + Send + 'static>>),
    /// Result stored, waiting to be moved out by the next poll.
    Ready(R),
    /// Result already taken.
    Finished,
}

impl<R> Task<R> {
    /// Wraps `body` as an awaitable task. The body is not polled here.
    pub fn new(body: impl Future<Output = R> + Send + 'static) -> Self {
        Self { state: State::Running(Box::pin(body)) }
    }

    /// A task that is already done and will yield `value` without
    /// suspending its caller.
    pub fn ready(value: R) -> Self {
        Self { state: State::Ready(value) }
    }

    /// Whether awaiting this task would complete without running any body.
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, State::Running(_))
    }
}

// The body is boxed and the stored result is moved out by value, so pinning
// the wrapper pins nothing that relies on address stability.
impl<R> Unpin for Task<R> {}

impl<R> Future for Task<R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();
        match &mut this.state {
            State::Running(body) => {
                let result = core::task::ready!(body.as_mut().poll(cx));
                this.state = State::Finished;
                Poll::Ready(result)
            }
            State::Ready(_) => {
                let State::Ready(result) = mem::replace(&mut this.state, State::Finished) else {
                    unreachable!()
                };
                Poll::Ready(result)
            }
            State::Finished => panic!("task polled after it yielded its result"),
        }
    }
}

impl<R> core::fmt::Debug for Task<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match &self.state {
            State::Running(_) => "running",
            State::Ready(_) => "ready",
            State::Finished => "finished",
        };
        f.debug_struct("Task").field("state", &state).finish()
    }
}

// -----------------------------------------------------------------------------
// execute

/// Drives a task chain to completion from non-suspendable code.
///
/// This is the bridge for callers that are not themselves jobs: the task is
/// awaited on the current thread and its result returned. Pure task chains
/// finish in a single pass; a body that yields is simply polled again.
///
/// Inside a job there is no need for this — await the task directly.
pub fn execute<R>(task: Task<R>) -> R {
    futures_lite::future::block_on(task)
}

// -----------------------------------------------------------------------------
// Tests
