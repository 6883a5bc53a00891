//! Combinators that compose tasks into higher-level control flow
//!
//! Each combinator returns a new lazy [`Task`] (except [`yield_now`], which
//! is a suspension point for the calling task). Awaiting a task inside
//! another task's body submits it as a child of the awaiting task, so
//! cancelling a combinator cancels the work it is waiting on.

use crate::context::{self, Driver};
use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::sync::Signal;
use crate::task::{SuspendReason, Task, TaskHandle, TaskJoin};
use crate::timer::TimerKey;
use std::future::{Future as StdFuture, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Sleep-until-timestamp suspension point
pub(crate) struct SleepUntil {
    wake_at: Instant,
    timer: Option<(TimerKey, Arc<dyn Driver>)>,
}

impl SleepUntil {
    pub(crate) fn new(wake_at: Instant) -> Self {
        Self {
            wake_at,
            timer: None,
        }
    }

    fn deregister(&mut self) {
        if let Some((key, driver)) = self.timer.take() {
            driver.cancel_timer(key);
        }
    }
}

impl StdFuture for SleepUntil {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = &mut *self;
        let wake_at = this.wake_at;
        if Instant::now() >= wake_at {
            this.deregister();
            return Poll::Ready(Ok(()));
        }
        if this.timer.is_none() {
            let Some(task) = context::current_task() else {
                return Poll::Ready(Err(Error::NoRuntime("sleep outside of a task")));
            };
            let Some(driver) = task.driver() else {
                return Poll::Ready(Err(Error::NoRuntime("sleeping task is not bound to a scheduler")));
            };
            let key = driver.add_timer(wake_at, task);
            this.timer = Some((key, driver));
        }
        context::set_suspend_reason(SuspendReason::Sleep { wake_at });
        Poll::Pending
    }
}

impl Drop for SleepUntil {
    fn drop(&mut self) {
        self.deregister();
    }
}

/// A task that suspends for `duration`, measured from when it is created
pub fn sleep(duration: Duration) -> Task<()> {
    sleep_until(Instant::now() + duration)
}

/// A task that suspends until `deadline`
pub fn sleep_until(deadline: Instant) -> Task<()> {
    let wait = SleepUntil::new(deadline);
    Task::named("sleep", async move { wait.await })
}

/// Future returned by [`yield_now`]
pub struct YieldNow {
    yielded: bool,
}

impl StdFuture for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        context::set_suspend_reason(SuspendReason::Yield);
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Give up the worker; the calling task is re-queued behind whatever is
/// already waiting on its worker
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Awaits every child; first observed failure wins
struct GatherAll<T> {
    joins: Vec<Option<TaskJoin<T>>>,
    values: Vec<Option<T>>,
    failure: Option<Error>,
}

// Values are only moved in and out, never pinned
impl<T> Unpin for GatherAll<T> {}

impl<T: Send + 'static> StdFuture for GatherAll<T> {
    type Output = Result<Vec<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Vec<T>>> {
        let this = &mut *self;
        let mut pending = 0;
        for (slot, value) in this.joins.iter_mut().zip(this.values.iter_mut()) {
            let Some(join) = slot else { continue };
            let polled = Pin::new(join).poll(cx);
            match polled {
                Poll::Ready(Ok(v)) => {
                    *value = Some(v);
                    *slot = None;
                }
                Poll::Ready(Err(err)) => {
                    if this.failure.is_none() {
                        this.failure = Some(err);
                    }
                    *slot = None;
                }
                Poll::Pending => pending += 1,
            }
        }
        if pending > 0 {
            return Poll::Pending;
        }
        if let Some(err) = this.failure.take() {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(this.values.iter_mut().filter_map(Option::take).collect()))
    }
}

/// A task that runs all `tasks` concurrently and completes once every one
/// of them is done.
///
/// Resolves to the children's values in input order. If any child fails,
/// the gather fails with the first failure observed; the other children
/// still run to completion and their outcomes are discarded.
pub fn gather<T: Send + 'static>(tasks: Vec<Task<T>>) -> Task<Vec<T>> {
    let values = tasks.iter().map(|_| None).collect();
    let joins = tasks.into_iter().map(|t| Some(t.into_future())).collect();
    let all = GatherAll {
        joins,
        values,
        failure: None,
    };
    Task::named("gather", all)
}

/// Wrap a blocking callable as a task. The callable runs on whichever
/// worker resumes the task.
///
/// With `lazy = false` the task is submitted to the current runtime right
/// away (detached); outside a runtime it stays lazy.
pub fn to_thread<T, F>(f: F, lazy: bool) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let task = Task::named("to_thread", async move { Ok(f()) });
    if !lazy {
        match Handle::current() {
            Some(handle) => {
                if let Err(err) = handle.add_task(&task) {
                    log::warn!("to_thread: eager submission failed: {}", err);
                }
            }
            None => log::debug!("to_thread: no runtime on this thread, staying lazy"),
        }
    }
    task
}

/// Races `task` against a timer; the loser is cancelled
struct Race<T> {
    task: TaskJoin<T>,
    task_handle: TaskHandle,
    timer: Option<TaskJoin<()>>,
    timer_handle: TaskHandle,
    limit: Duration,
}

impl<T: Send + 'static> StdFuture for Race<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let this = &mut *self;
        if let Poll::Ready(result) = Pin::new(&mut this.task).poll(cx) {
            this.timer_handle.cancel();
            return Poll::Ready(result);
        }
        if let Some(timer) = this.timer.as_mut() {
            let polled = Pin::new(timer).poll(cx);
            match polled {
                Poll::Ready(Ok(())) => {
                    this.task_handle.cancel();
                    return Poll::Ready(Err(Error::Timeout(this.limit)));
                }
                // Timer cancelled from outside: keep waiting on the task alone
                Poll::Ready(Err(_)) => this.timer = None,
                Poll::Pending => {}
            }
        }
        Poll::Pending
    }
}

/// A task that resolves to `task`'s result, or fails with
/// [`Error::Timeout`] if `limit` elapses first. Whichever branch loses is
/// cancelled.
pub fn wait_until<T: Send + 'static>(task: Task<T>, limit: Duration) -> Task<T> {
    let timer = sleep(limit);
    let race = Race {
        task_handle: task.handle(),
        task: task.into_future(),
        timer_handle: timer.handle(),
        timer: Some(timer.into_future()),
        limit,
    };
    Task::named("wait_until", race)
}

/// A task that holds back `task` until `signal` fires, then submits it and
/// resolves to its result
pub fn wait_for<T, S>(task: Task<T>, signal: &S) -> Task<T>
where
    T: Send + 'static,
    S: Signal + ?Sized,
{
    let gate = signal.wait();
    Task::named("wait_for", async move {
        gate.await?;
        task.await
    })
}

/// Submit `task` to the current runtime without awaiting it (detached)
pub fn add_task<T>(task: &Task<T>) -> Result<()> {
    Handle::current()
        .ok_or(Error::NoRuntime("add_task outside of a running task"))?
        .add_task(task)
}
