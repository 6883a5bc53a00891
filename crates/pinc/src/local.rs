//! Blocking bridge: drive a task to completion on the calling thread

use crate::context::Driver;
use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::task::{RawTask, Task};
use crate::timer::{TimerKey, TimerQueue};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

struct LocalState {
    ready: VecDeque<Arc<RawTask>>,
    timers: TimerQueue,
}

/// Driver whose ready queue and timers are serviced by one blocked caller
struct LocalDriver {
    state: Mutex<LocalState>,
    wakeup: Condvar,
    /// Runtime of the task that called `sync`, if any
    outer: Option<Handle>,
}

impl LocalDriver {
    fn new(outer: Option<Handle>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LocalState {
                ready: VecDeque::new(),
                timers: TimerQueue::new(),
            }),
            wakeup: Condvar::new(),
            outer,
        })
    }

    /// Resume ready tasks and fire timers until `root` is terminal
    fn run(&self, root: &Arc<RawTask>) {
        loop {
            let mut state = self.state.lock();
            if root.state().is_terminal() {
                return;
            }

            let expired = state.timers.pop_expired(Instant::now());
            if !expired.is_empty() {
                drop(state);
                for task in expired {
                    task.wake_task();
                }
                continue;
            }

            if let Some(task) = state.ready.pop_front() {
                drop(state);
                task.resume();
                continue;
            }

            // Nothing local to do: wait for a timer or an external wake
            match state.timers.next_deadline() {
                Some(deadline) => {
                    self.wakeup.wait_until(&mut state, deadline);
                }
                None => self.wakeup.wait(&mut state),
            }
        }
    }
}

impl Driver for LocalDriver {
    fn schedule(&self, task: Arc<RawTask>) {
        self.state.lock().ready.push_back(task);
        self.wakeup.notify_one();
    }

    fn add_timer(&self, wake_at: Instant, task: Arc<RawTask>) -> TimerKey {
        let (key, _) = self.state.lock().timers.insert(wake_at, task);
        self.wakeup.notify_one();
        key
    }

    fn cancel_timer(&self, key: TimerKey) -> bool {
        self.state.lock().timers.remove(key)
    }

    fn task_started(&self, _task: &Arc<RawTask>) {}

    fn task_finished(&self, _task: &RawTask) {
        // Take the lock so a waiting `run` cannot miss the root finishing
        let _state = self.state.lock();
        self.wakeup.notify_one();
    }

    fn handle(&self) -> Option<Handle> {
        self.outer.clone()
    }
}

/// Run `task` to completion, servicing its suspensions (sleeps, nested
/// awaits, gathers) on the calling thread only, and return its result.
///
/// Blocks until the task is Completed or Failed. A task that was resumed
/// by hand but never submitted is taken over and driven from where it left
/// off. A task already submitted to a scheduler is not driven locally; the
/// call waits for its result instead.
pub fn sync<T: Send + 'static>(task: Task<T>) -> Result<T> {
    let raw = task.raw().clone();
    if raw.state().is_terminal() && !raw.is_bound() {
        return finished(&task);
    }
    let driver = LocalDriver::new(Handle::current());
    if !raw.submit(driver.clone()) && !raw.adopt(driver.clone()) {
        return task.join();
    }
    log::trace!("driving task {} on the calling thread", raw.id());
    driver.run(&raw);
    finished(&task)
}

fn finished<T>(task: &Task<T>) -> Result<T> {
    task.try_take()
        .unwrap_or_else(|| Err(Error::InvalidState("future is pending".to_string())))
}
