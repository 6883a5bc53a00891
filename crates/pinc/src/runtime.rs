//! Runtime entry points: run a root task to completion and report an exit code
//!
//! A [`Runtime`] boots a [`Scheduler`], submits the root task and blocks
//! until either the root finishes or someone calls [`Handle::stop`]. The
//! stop request is delivered over a channel to the thread that called
//! `start`, so a task may stop its own runtime without joining the worker
//! it is running on.

use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{Error, Result};
use crate::pool::PoolStats;
use crate::scheduler::{Scheduler, SchedulerShared, SchedulerState, SchedulerStats};
use crate::task::Task;
use crossbeam::channel::{self, Sender};
use std::fmt;
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::time::Duration;

/// The root task completed
pub const EXIT_SUCCESS: i32 = 0;
/// The root task failed, or there was no runtime to act on
pub const EXIT_FAILURE: i32 = 1;
/// The runtime was force-stopped before the root task finished
pub const EXIT_ABORTED: i32 = 2;

/// Cloneable handle to a running scheduler
#[derive(Clone)]
pub struct Handle {
    shared: Arc<SchedulerShared>,
}

impl Handle {
    pub(crate) fn from_shared(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn is_for(&self, shared: &SchedulerShared) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.shared), shared)
    }

    /// Handle of the runtime driving the task on the current thread
    pub fn current() -> Option<Handle> {
        context::current_driver().and_then(|driver| driver.handle())
    }

    /// Submit a detached task for immediate execution
    pub fn add_task<T>(&self, task: &Task<T>) -> Result<()> {
        self.shared.add_task(task.raw())
    }

    /// Submit a detached task once `delay` has elapsed
    pub fn add_timer<T>(&self, delay: Duration, task: &Task<T>) -> Result<()> {
        self.shared.add_timer(delay, task.raw())
    }

    /// Request shutdown. `force = true` abandons suspended and queued work;
    /// `force = false` lets every live task finish first.
    ///
    /// Returns [`EXIT_SUCCESS`] if the request was accepted, or
    /// [`EXIT_FAILURE`] if the scheduler is not running.
    pub fn stop(&self, force: bool) -> i32 {
        if self.shared.request_stop(force) {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    /// Scheduler lifecycle state
    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }

    /// Per-worker queue statistics
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.shared.pool_stats()
    }

    /// Configuration the scheduler was built with
    pub fn config(&self) -> &RuntimeConfig {
        self.shared.config()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("state", &self.state())
            .finish()
    }
}

/// Sends once when the root task's Future completes
struct RootDone(Sender<()>);

impl Wake for RootDone {
    fn wake(self: Arc<Self>) {
        let _ = self.0.try_send(());
    }
}

/// Boots a scheduler for one root task
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    /// Create a runtime with an explicit configuration
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Create a runtime from `PINC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(RuntimeConfig::from_env()?))
    }

    /// Get the runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run `root` to completion and return its result
    pub fn block_on<T: Send + 'static>(&self, root: Task<T>) -> Result<T> {
        self.run(&root)?;
        root.try_take().unwrap_or_else(|| {
            Err(Error::InvalidState(
                "runtime stopped before the root task finished".to_string(),
            ))
        })
    }

    /// Run `root` to completion and return a process exit code
    pub fn start<T: Send + 'static>(&self, root: Task<T>) -> i32 {
        if let Err(err) = self.run(&root) {
            log::error!("runtime failed: {}", err);
            return EXIT_FAILURE;
        }
        match root.try_take() {
            Some(Ok(_)) => EXIT_SUCCESS,
            Some(Err(err)) => {
                log::error!("root task {} failed: {}", root.id(), err);
                EXIT_FAILURE
            }
            None => {
                log::warn!("root task {} abandoned by forced stop", root.id());
                EXIT_ABORTED
            }
        }
    }

    fn run<T: Send + 'static>(&self, root: &Task<T>) -> Result<()> {
        let scheduler = Scheduler::new(self.config.clone());
        let (stop_tx, stop_rx) = channel::unbounded();
        scheduler.shared().set_stop_requests(Some(stop_tx));

        let (done_tx, done_rx) = channel::bounded(1);
        let done = Waker::from(Arc::new(RootDone(done_tx)));
        if root.result().register_waker(&done) {
            return Err(Error::InvalidState("root task already finished".to_string()));
        }

        scheduler.start()?;
        scheduler.add_task(root)?;
        log::debug!(
            "runtime running root task {} on {} workers",
            root.id(),
            scheduler.worker_count()
        );

        channel::select! {
            recv(done_rx) -> _ => {
                scheduler.stop(!self.config.drain_on_exit);
            }
            recv(stop_rx) -> request => {
                scheduler.stop(request.unwrap_or(true));
            }
        }
        scheduler.shared().set_stop_requests(None);
        Ok(())
    }
}

/// Boot a pool of `pool_size` workers (0 = `PINC_POOL_SIZE` or the CPU
/// count), run `root` until it completes, tear down, and return the exit code
pub fn start<T: Send + 'static>(root: Task<T>, pool_size: usize) -> i32 {
    let mut config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("{}", err);
            return EXIT_FAILURE;
        }
    };
    if pool_size > 0 {
        config.pool_size = pool_size;
    }
    Runtime::new(config).start(root)
}

/// Request shutdown of the runtime driving the current task
pub fn stop(force: bool) -> i32 {
    match Handle::current() {
        Some(handle) => handle.stop(force),
        None => {
            log::warn!("stop requested outside of a running task");
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sleep;
    use crate::task::TaskState;
    use std::time::Instant;

    fn small() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_pool_size(2))
    }

    #[test]
    fn test_block_on_returns_root_value() {
        let value = small().block_on(Task::new(async { Ok("hello") })).unwrap();
        assert_eq!(value, "hello");
    }

    #[test]
    fn test_start_exit_codes() {
        assert_eq!(small().start(Task::new(async { Ok(()) })), EXIT_SUCCESS);
        let failing: Task<()> = Task::new(async { Err(Error::user("root failed")) });
        assert_eq!(small().start(failing), EXIT_FAILURE);
    }

    #[test]
    fn test_handle_current_inside_task() {
        let found = small()
            .block_on(Task::new(async { Ok(Handle::current().is_some()) }))
            .unwrap();
        assert!(found);
        assert!(Handle::current().is_none());
    }

    #[test]
    fn test_stop_outside_runtime() {
        assert_eq!(stop(false), EXIT_FAILURE);
    }

    #[test]
    fn test_forced_stop_from_root_aborts() {
        let root: Task<()> = Task::new(async {
            assert_eq!(stop(true), EXIT_SUCCESS);
            sleep(Duration::from_secs(30)).await?;
            Ok(())
        });
        let handle = root.handle();
        let started = Instant::now();
        assert_eq!(small().start(root), EXIT_ABORTED);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!handle.is_done());
    }

    #[test]
    fn test_graceful_stop_lets_root_finish() {
        let root = Task::new(async {
            assert_eq!(stop(false), EXIT_SUCCESS);
            sleep(Duration::from_millis(30)).await?;
            Ok(5)
        });
        let handle = root.handle();
        assert_eq!(small().start(root), EXIT_SUCCESS);
        assert_eq!(handle.state(), TaskState::Completed);
    }

    #[test]
    fn test_drain_on_exit_waits_for_detached_tasks() {
        let detached = Task::new(async {
            sleep(Duration::from_millis(40)).await?;
            Ok(())
        });
        let detached_handle = detached.handle();
        let runtime = Runtime::new(
            RuntimeConfig::default()
                .with_pool_size(1)
                .with_drain_on_exit(true),
        );
        let root = Task::new(async move {
            let handle = Handle::current().ok_or(Error::NoRuntime("test"))?;
            handle.add_task(&detached)?;
            Ok(())
        });
        assert_eq!(runtime.start(root), EXIT_SUCCESS);
        assert_eq!(detached_handle.state(), TaskState::Completed);
    }
}
