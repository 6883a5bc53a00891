//! Task structure and execution state
//!
//! A task owns an opaque continuation (a boxed, pinned body) that it
//! re-enters once per `resume()`. The body runs until it completes or
//! reaches a suspension point, which registers the task somewhere that
//! will later wake it (a timer, an event, another task's Future).

use crate::context::{self, Driver};
use crate::error::{Error, Result};
use crate::future::Future;
use crate::timer::TimerKey;
use parking_lot::Mutex;
use std::fmt;
use std::future::{Future as StdFuture, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

/// Reason why a task is suspended
///
/// Tells an observer what condition must become true before the task is
/// made ready again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// Sleeping until a specific time
    Sleep {
        /// When to wake up
        wake_at: Instant,
    },

    /// Waiting for another task to complete
    AwaitTask(TaskId),

    /// Waiting for an Event to be set
    WaitEvent,

    /// Waiting for a Condition's predicate to hold
    WaitCondition,

    /// Voluntarily yielded; already re-queued
    Yield,
}

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, not yet submitted (work starts only when first resumed)
    Created,
    /// Queued for a worker
    Ready,
    /// Currently executing on a worker
    Running,
    /// Parked at a suspension point
    Suspended,
    /// Finished with a value
    Completed,
    /// Finished with an error (including cancellation)
    Failed,
}

impl TaskState {
    /// Completed or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

type Body = Pin<Box<dyn StdFuture<Output = ()> + Send + 'static>>;

const UNASSIGNED: usize = usize::MAX;

/// Type-erased view of a task's result slot
pub(crate) trait Outcome: Send + Sync {
    /// The body finished with an error
    fn staged_failed(&self) -> bool;

    /// Move the staged result into the Future, waking its readers
    fn publish(&self);

    /// Fail the Future directly, discarding anything staged
    fn fail(&self, error: Error);
}

struct TaskOutput<T> {
    /// Written by the body when it returns; published after the state flips
    staged: Mutex<Option<Result<T>>>,
    future: Future<T>,
}

impl<T: Send> Outcome for TaskOutput<T> {
    fn staged_failed(&self) -> bool {
        matches!(*self.staged.lock(), Some(Err(_)))
    }

    fn publish(&self) {
        let staged = self.staged.lock().take();
        if let Some(result) = staged {
            let _ = self.future.set_result(result);
        }
    }

    fn fail(&self, error: Error) {
        self.staged.lock().take();
        let _ = self.future.set_exception(error);
    }
}

struct Lifecycle {
    state: TaskState,
    /// Woken while Running; re-queue instead of suspending
    notified: bool,
    cancelled: bool,
}

/// Shared, type-erased task
pub(crate) struct RawTask {
    id: TaskId,
    name: Option<String>,
    lifecycle: Mutex<Lifecycle>,
    /// The continuation; `None` while a worker holds it or once terminal
    body: Mutex<Option<Body>>,
    output: Arc<dyn Outcome>,
    suspend_reason: Mutex<Option<SuspendReason>>,
    /// Bound at first submission, never rebound
    driver: OnceLock<Arc<dyn Driver>>,
    /// Pool worker this task is pinned to
    worker: AtomicUsize,
    /// Timer holding a not-yet-started task (deferred submission)
    deferred: Mutex<Option<TimerKey>>,
    children: Mutex<Vec<Weak<RawTask>>>,
    resumes: AtomicU64,
}

impl RawTask {
    fn new(name: Option<String>, body: Body, output: Arc<dyn Outcome>) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::new(),
            name,
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Created,
                notified: false,
                cancelled: false,
            }),
            body: Mutex::new(Some(body)),
            output,
            suspend_reason: Mutex::new(None),
            driver: OnceLock::new(),
            worker: AtomicUsize::new(UNASSIGNED),
            deferred: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            resumes: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn state(&self) -> TaskState {
        self.lifecycle.lock().state
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lifecycle.lock().cancelled
    }

    pub(crate) fn suspend_reason(&self) -> Option<SuspendReason> {
        self.suspend_reason.lock().clone()
    }

    pub(crate) fn set_suspend_reason(&self, reason: SuspendReason) {
        *self.suspend_reason.lock() = Some(reason);
    }

    pub(crate) fn resume_count(&self) -> u64 {
        self.resumes.load(Ordering::Relaxed)
    }

    pub(crate) fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver.get().cloned()
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.driver.get().is_some()
    }

    /// Worker this task is pinned to, if any
    pub(crate) fn worker(&self) -> Option<usize> {
        match self.worker.load(Ordering::Acquire) {
            UNASSIGNED => None,
            k => Some(k),
        }
    }

    /// Pin to `candidate` unless already pinned; returns the effective worker
    pub(crate) fn assign_worker(&self, candidate: usize) -> usize {
        match self.worker.compare_exchange(
            UNASSIGNED,
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => candidate,
            Err(existing) => existing,
        }
    }

    /// Bind to `driver` and queue for execution (Created -> Ready).
    /// Returns false if the task was already submitted or is terminal.
    pub(crate) fn submit(self: &Arc<Self>, driver: Arc<dyn Driver>) -> bool {
        {
            let mut lc = self.lifecycle.lock();
            if lc.state != TaskState::Created || self.driver.set(driver.clone()).is_err() {
                return false;
            }
            lc.state = TaskState::Ready;
        }
        driver.task_started(self);
        driver.schedule(self.clone());
        true
    }

    /// Bind to `driver` but hold the task in its timer queue until `wake_at`
    /// (Created -> Suspended).
    pub(crate) fn defer(self: &Arc<Self>, driver: Arc<dyn Driver>, wake_at: Instant) -> bool {
        {
            let mut lc = self.lifecycle.lock();
            if lc.state != TaskState::Created || self.driver.set(driver.clone()).is_err() {
                return false;
            }
            lc.state = TaskState::Suspended;
        }
        self.set_suspend_reason(SuspendReason::Sleep { wake_at });
        driver.task_started(self);
        let key = driver.add_timer(wake_at, self.clone());
        *self.deferred.lock() = Some(key);
        true
    }

    /// Submit `child` to this task's driver and record it for cancellation
    pub(crate) fn spawn_child(self: &Arc<Self>, child: &Arc<RawTask>) -> Result<bool> {
        let driver = self
            .driver()
            .ok_or(Error::NoRuntime("parent task is not bound to a scheduler"))?;
        {
            let mut children = self.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(child));
        }
        Ok(child.submit(driver))
    }

    /// Bind an unbound task that was already resumed by hand, queueing it
    /// on `driver` if it is Ready. Returns false if the task is still
    /// Created, already bound, or terminal.
    pub(crate) fn adopt(self: &Arc<Self>, driver: Arc<dyn Driver>) -> bool {
        let ready = {
            let lc = self.lifecycle.lock();
            if matches!(lc.state, TaskState::Created | TaskState::Completed | TaskState::Failed)
                || self.driver.set(driver.clone()).is_err()
            {
                return false;
            }
            lc.state == TaskState::Ready
        };
        driver.task_started(self);
        if ready {
            driver.schedule(self.clone());
        }
        true
    }

    /// Make a suspended task ready again
    pub(crate) fn wake_task(self: &Arc<Self>) {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            TaskState::Suspended => {
                lc.state = TaskState::Ready;
                // Read under the lock: `adopt` binds and checks Ready under it too
                let driver = self.driver();
                drop(lc);
                self.deferred.lock().take();
                if let Some(driver) = driver {
                    driver.schedule(self.clone());
                }
            }
            TaskState::Running => lc.notified = true,
            TaskState::Created | TaskState::Ready | TaskState::Completed | TaskState::Failed => {}
        }
    }

    /// Run the body to its next suspension point or to completion.
    ///
    /// A no-op on terminal tasks. Panics in the body are captured into the
    /// task's Future as `Error::Panicked`.
    pub(crate) fn resume(self: &Arc<Self>) -> TaskState {
        {
            let mut lc = self.lifecycle.lock();
            match lc.state {
                TaskState::Completed | TaskState::Failed => return lc.state,
                TaskState::Running => {
                    lc.notified = true;
                    return TaskState::Running;
                }
                _ => {}
            }
            lc.state = TaskState::Running;
            lc.notified = false;
        }
        *self.suspend_reason.lock() = None;

        let body = self.body.lock().take();
        let Some(mut body) = body else {
            return self.fail_with(Error::InvalidState(
                "task continuation already released".to_string(),
            ));
        };
        self.resumes.fetch_add(1, Ordering::Relaxed);

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let polled = {
            let _guard = context::enter(self.clone());
            panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)))
        };

        match polled {
            Ok(Poll::Ready(())) => {
                drop(body);
                self.complete()
            }
            Ok(Poll::Pending) => {
                *self.body.lock() = Some(body);
                let mut lc = self.lifecycle.lock();
                if lc.cancelled {
                    drop(lc);
                    let body = self.body.lock().take();
                    drop(body);
                    return self.fail_with(Error::Cancelled);
                }
                if std::mem::take(&mut lc.notified) {
                    lc.state = TaskState::Ready;
                    let driver = self.driver();
                    drop(lc);
                    if let Some(driver) = driver {
                        driver.schedule(self.clone());
                    }
                    TaskState::Ready
                } else {
                    lc.state = TaskState::Suspended;
                    TaskState::Suspended
                }
            }
            Err(payload) => {
                drop(body);
                let message = panic_message(payload.as_ref());
                log::debug!("task {} panicked: {}", self.id, message);
                self.fail_with(Error::Panicked(message))
            }
        }
    }

    fn complete(&self) -> TaskState {
        let state = if self.output.staged_failed() {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        self.lifecycle.lock().state = state;
        self.output.publish();
        self.release();
        log::trace!("task {} finished: {:?}", self.id, state);
        state
    }

    fn fail_with(&self, error: Error) -> TaskState {
        self.lifecycle.lock().state = TaskState::Failed;
        self.output.fail(error);
        self.release();
        TaskState::Failed
    }

    fn release(&self) {
        *self.suspend_reason.lock() = None;
        self.children.lock().clear();
        if let Some(driver) = self.driver.get() {
            driver.task_finished(self);
        }
    }

    /// Cancel this task and, transitively, its children.
    ///
    /// A suspended or queued task fails immediately with `Cancelled` and
    /// its continuation is dropped, which deregisters it from timers and
    /// wait lists. A running task is flagged and fails at its next
    /// suspension point. Returns false if the task was already terminal.
    pub(crate) fn cancel(self: &Arc<Self>) -> bool {
        let running = {
            let mut lc = self.lifecycle.lock();
            if lc.state.is_terminal() {
                return false;
            }
            lc.cancelled = true;
            let running = lc.state == TaskState::Running;
            if !running {
                lc.state = TaskState::Failed;
            }
            running
        };

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
        if running {
            return true;
        }

        if let Some(key) = self.deferred.lock().take() {
            if let Some(driver) = self.driver.get() {
                driver.cancel_timer(key);
            }
        }
        let body = self.body.lock().take();
        drop(body);
        self.output.fail(Error::Cancelled);
        self.release();
        log::trace!("task {} cancelled", self.id);
        true
    }
}

impl Wake for RawTask {
    fn wake(self: Arc<Self>) {
        self.wake_task();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_task();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A resumable unit of asynchronous work producing a single result or error
///
/// Tasks are lazy: the body does not run until the task is submitted to a
/// scheduler (or driven by [`sync`](crate::sync)). Awaiting a task inside
/// another task's body submits it if needed, suspends the caller, and yields
/// its result.
pub struct Task<T> {
    raw: Arc<RawTask>,
    output: Arc<TaskOutput<T>>,
}

impl<T: Send + 'static> Task<T> {
    /// Create a task from an async body
    pub fn new<F>(body: F) -> Self
    where
        F: StdFuture<Output = Result<T>> + Send + 'static,
    {
        Self::build(None, body)
    }

    /// Create a named task (the name shows up in logs and `Debug`)
    pub fn named<F>(name: impl Into<String>, body: F) -> Self
    where
        F: StdFuture<Output = Result<T>> + Send + 'static,
    {
        Self::build(Some(name.into()), body)
    }

    fn build<F>(name: Option<String>, body: F) -> Self
    where
        F: StdFuture<Output = Result<T>> + Send + 'static,
    {
        let output = Arc::new(TaskOutput {
            staged: Mutex::new(None),
            future: Future::new(),
        });
        let sink = output.clone();
        let body = async move {
            let result = body.await;
            *sink.staged.lock() = Some(result);
        };
        let raw = RawTask::new(name, Box::pin(body), output.clone());
        Self { raw, output }
    }
}

impl<T> Task<T> {
    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.raw.id()
    }

    /// Optional task name
    pub fn name(&self) -> Option<&str> {
        self.raw.name()
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        self.raw.state()
    }

    /// True once Completed or Failed
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// True if `cancel()` was called before the task finished on its own
    pub fn is_cancelled(&self) -> bool {
        self.raw.is_cancelled()
    }

    /// Why the task is currently suspended
    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        self.raw.suspend_reason()
    }

    /// Run the task on the calling thread until its next suspension point.
    /// A no-op once the task is terminal.
    pub fn resume(&self) -> TaskState {
        self.raw.resume()
    }

    /// How many times the body has been entered
    pub fn resume_count(&self) -> u64 {
        self.raw.resume_count()
    }

    /// Cancel the task (see [`TaskHandle::cancel`])
    pub fn cancel(&self) -> bool {
        self.raw.cancel()
    }

    /// Cloneable, untyped view of this task
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            raw: self.raw.clone(),
        }
    }

    /// The task's result cell
    pub fn result(&self) -> &Future<T> {
        &self.output.future
    }

    /// Move the result out without blocking. `None` while running.
    pub fn try_take(&self) -> Option<Result<T>> {
        self.output.future.take()
    }

    /// Block the calling thread until the task finishes and return its result.
    ///
    /// The task must already be submitted; use [`sync`](crate::sync) to
    /// drive an unsubmitted (or hand-resumed) task on the calling thread.
    pub fn join(self) -> Result<T> {
        let state = self.state();
        if state == TaskState::Created {
            return Err(Error::InvalidState("task was never submitted".to_string()));
        }
        if !state.is_terminal() && !self.raw.is_bound() {
            // Nothing would ever resume it
            return Err(Error::InvalidState(
                "task is not bound to a scheduler; drive it with sync".to_string(),
            ));
        }
        self.output.future.wait();
        self.output
            .future
            .take()
            .unwrap_or_else(|| Err(Error::InvalidState("future is pending".to_string())))
    }

    pub(crate) fn raw(&self) -> &Arc<RawTask> {
        &self.raw
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Send + 'static> IntoFuture for Task<T> {
    type Output = Result<T>;
    type IntoFuture = TaskJoin<T>;

    fn into_future(self) -> TaskJoin<T> {
        TaskJoin { task: self }
    }
}

/// Await-nested-task suspension point
///
/// Submits the task to the awaiting task's scheduler if it has not started,
/// suspends the awaiting task, and yields the result or error on resume.
pub struct TaskJoin<T> {
    task: Task<T>,
}

impl<T> TaskJoin<T> {
    /// Untyped view of the awaited task
    pub fn handle(&self) -> TaskHandle {
        self.task.handle()
    }
}

impl<T: Send + 'static> StdFuture for TaskJoin<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let raw = self.task.raw();
        if !raw.is_bound() && raw.state() == TaskState::Created {
            match context::current_task() {
                Some(parent) => {
                    if let Err(err) = parent.spawn_child(raw) {
                        return Poll::Ready(Err(err));
                    }
                }
                None => {
                    return Poll::Ready(Err(Error::NoRuntime(
                        "awaited task was never submitted",
                    )))
                }
            }
        }
        match self.task.output.future.poll_take(cx.waker()) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                context::set_suspend_reason(SuspendReason::AwaitTask(raw.id()));
                Poll::Pending
            }
        }
    }
}

/// Cloneable, untyped handle for observing or cancelling a task
#[derive(Clone)]
pub struct TaskHandle {
    raw: Arc<RawTask>,
}

impl TaskHandle {
    /// Get the task ID
    pub fn task_id(&self) -> TaskId {
        self.raw.id()
    }

    /// Optional task name
    pub fn name(&self) -> Option<&str> {
        self.raw.name()
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.raw.state()
    }

    /// True once Completed or Failed
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// True if the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.raw.is_cancelled()
    }

    /// Why the task is currently suspended
    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        self.raw.suspend_reason()
    }

    /// Pool worker this task is pinned to, once dispatched
    pub fn worker(&self) -> Option<usize> {
        self.raw.worker()
    }

    /// Forcibly fail the task with `Cancelled`, cancelling its children.
    ///
    /// Cooperative: a task that is mid-step finishes the step and fails at
    /// its next suspension point. Returns false if already terminal.
    pub fn cancel(&self) -> bool {
        self.raw.cancel()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.task_id())
            .field("state", &self.state())
            .finish()
    }
}
