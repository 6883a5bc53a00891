//! Per-thread execution context and the driver seam
//!
//! While a task is being resumed, it is the "current task" of the resuming
//! thread. Suspension points use it to find the driver (the pool-backed
//! scheduler, or the local driver of a `sync` call) the task is bound to.

use crate::runtime::Handle;
use crate::task::{RawTask, SuspendReason};
use crate::timer::TimerKey;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// What a task needs from whoever runs it
pub(crate) trait Driver: Send + Sync {
    /// Queue a ready task for resumption
    fn schedule(&self, task: Arc<RawTask>);

    /// Wake `task` once `wake_at` has passed
    fn add_timer(&self, wake_at: Instant, task: Arc<RawTask>) -> TimerKey;

    /// Remove a pending timer. Returns false if it already fired.
    fn cancel_timer(&self, key: TimerKey) -> bool;

    /// A task was bound to this driver
    fn task_started(&self, task: &Arc<RawTask>);

    /// A bound task reached a terminal state
    fn task_finished(&self, task: &RawTask);

    /// Public handle, if this driver is a full runtime
    fn handle(&self) -> Option<Handle>;
}

thread_local! {
    /// Stack of tasks being resumed on this thread (nested by `sync` inside a task)
    static CURRENT: RefCell<Vec<Arc<RawTask>>> = const { RefCell::new(Vec::new()) };
}

/// Restores the previous current task on drop
pub(crate) struct EnterGuard {
    _not_send: PhantomData<*const ()>,
}

/// Make `task` the current task until the guard is dropped
pub(crate) fn enter(task: Arc<RawTask>) -> EnterGuard {
    CURRENT.with(|current| current.borrow_mut().push(task));
    EnterGuard {
        _not_send: PhantomData,
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let _ = CURRENT.try_with(|current| current.borrow_mut().pop());
    }
}

/// The task being resumed on this thread
pub(crate) fn current_task() -> Option<Arc<RawTask>> {
    CURRENT
        .try_with(|current| current.borrow().last().cloned())
        .ok()
        .flatten()
}

/// Driver of the current task
pub(crate) fn current_driver() -> Option<Arc<dyn Driver>> {
    current_task().and_then(|task| task.driver())
}

/// Record why the current task is about to suspend
pub(crate) fn set_suspend_reason(reason: SuspendReason) {
    if let Some(task) = current_task() {
        task.set_suspend_reason(reason);
    }
}
