//! Main task scheduler coordinating the pool and the timer thread

use crate::config::RuntimeConfig;
use crate::context::{self, Driver};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolStats};
use crate::runtime::Handle;
use crate::task::{RawTask, Task, TaskId, TaskState};
use crate::timer::{TimerKey, TimerThread};
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total tasks bound to this scheduler
    pub tasks_spawned: u64,

    /// Tasks that finished with a value
    pub tasks_completed: u64,

    /// Tasks that finished with an error (including cancellation)
    pub tasks_failed: u64,

    /// Tasks bound but not yet terminal
    pub active_tasks: usize,

    /// Entries waiting in the timer queue
    pub pending_timers: usize,
}

/// Lifecycle of a scheduler
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    /// Constructed; submissions queue but nothing runs
    Init,
    /// Workers and timer thread are running
    Running,
    /// `stop` is in progress
    Draining,
    /// Workers and timer thread have exited
    Stopped,
}

pub(crate) struct SchedulerShared {
    config: RuntimeConfig,
    state: Mutex<SchedulerState>,
    pool: Pool,
    timer: Arc<TimerThread>,
    /// Live (bound, non-terminal) tasks
    tasks: Mutex<FxHashMap<TaskId, Arc<RawTask>>>,
    idle: Condvar,
    /// Where `Handle::stop` requests go while a runtime owns this scheduler
    stop_requests: Mutex<Option<Sender<bool>>>,
    tasks_spawned: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    me: Weak<SchedulerShared>,
}

impl SchedulerShared {
    fn driver(&self) -> Result<Arc<dyn Driver>> {
        let me: Arc<dyn Driver> = self
            .me
            .upgrade()
            .ok_or(Error::NoRuntime("scheduler has been dropped"))?;
        Ok(me)
    }

    fn accepts_submissions(&self) -> Result<()> {
        match *self.state.lock() {
            SchedulerState::Init | SchedulerState::Running => Ok(()),
            state => Err(Error::InvalidState(format!(
                "scheduler is {:?}; submissions are closed",
                state
            ))),
        }
    }

    pub(crate) fn add_task(&self, task: &Arc<RawTask>) -> Result<()> {
        self.accepts_submissions()?;
        if task.submit(self.driver()?) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "task {} was already submitted",
                task.id()
            )))
        }
    }

    pub(crate) fn add_timer(&self, delay: Duration, task: &Arc<RawTask>) -> Result<()> {
        self.accepts_submissions()?;
        if task.defer(self.driver()?, Instant::now() + delay) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "task {} was already submitted",
                task.id()
            )))
        }
    }

    pub(crate) fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn set_stop_requests(&self, requests: Option<Sender<bool>>) {
        *self.stop_requests.lock() = requests;
    }

    /// Ask for shutdown without blocking the caller. Returns false if the
    /// scheduler is not running.
    pub(crate) fn request_stop(&self, force: bool) -> bool {
        if self.state() != SchedulerState::Running {
            return false;
        }
        if let Some(requests) = self.stop_requests.lock().as_ref() {
            return requests.send(force).is_ok();
        }

        let on_own_task = context::current_driver()
            .and_then(|driver| driver.handle())
            .map_or(false, |handle| handle.is_for(self));
        if !on_own_task {
            self.stop(force);
            return true;
        }

        // Joining our own worker (or draining our own task) would deadlock
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        let name = format!("{}-stop", self.config.thread_name_prefix);
        match thread::Builder::new().name(name).spawn(move || me.stop(force)) {
            Ok(_) => true,
            Err(err) => {
                log::error!("failed to spawn stop thread: {}", err);
                false
            }
        }
    }

    pub(crate) fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SchedulerState::Init => {}
            SchedulerState::Running => return Ok(()),
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot start a scheduler that is {:?}",
                    other
                )))
            }
        }
        let prefix = &self.config.thread_name_prefix;
        self.pool.start(prefix)?;
        self.timer.start(format!("{}-timer", prefix))?;
        *state = SchedulerState::Running;
        log::debug!("scheduler started with {} workers", self.pool.size());
        Ok(())
    }

    pub(crate) fn stop(&self, force: bool) {
        let force = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                SchedulerState::Draining | SchedulerState::Stopped => return,
                SchedulerState::Init | SchedulerState::Running => *state = SchedulerState::Draining,
            }
            // Nothing can drain without workers
            force || previous == SchedulerState::Init
        };
        log::debug!("scheduler stopping (force: {})", force);

        if force {
            // Workers first: a task mid-resume may still register a timer
            let queued = self.pool.stop(true);
            self.timer.stop();
            let timers = self.timer.clear();
            let live = std::mem::take(&mut *self.tasks.lock());
            self.idle.notify_all();
            log::debug!(
                "abandoned {} live tasks ({} timers, {} queued)",
                live.len(),
                timers.len(),
                queued.len()
            );
        } else {
            {
                let mut tasks = self.tasks.lock();
                while !tasks.is_empty() {
                    self.idle.wait(&mut tasks);
                }
            }
            self.pool.stop(false);
            self.timer.stop();
        }

        *self.state.lock() = SchedulerState::Stopped;
        log::debug!("scheduler stopped");
    }

    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock();
        while !tasks.is_empty() {
            if self.idle.wait_until(&mut tasks, deadline).timed_out() {
                return tasks.is_empty();
            }
        }
        true
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_spawned: self.tasks_spawned.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            active_tasks: self.tasks.lock().len(),
            pending_timers: self.timer.pending(),
        }
    }

    pub(crate) fn pool_stats(&self) -> Vec<PoolStats> {
        self.pool.stats()
    }
}

impl Driver for SchedulerShared {
    fn schedule(&self, task: Arc<RawTask>) {
        self.pool.submit(task);
    }

    fn add_timer(&self, wake_at: Instant, task: Arc<RawTask>) -> TimerKey {
        self.timer.register(wake_at, task)
    }

    fn cancel_timer(&self, key: TimerKey) -> bool {
        self.timer.cancel(key)
    }

    fn task_started(&self, task: &Arc<RawTask>) {
        self.tasks_spawned.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(task.id(), task.clone());
        log::trace!("task {} bound ({:?})", task.id(), task.name());
    }

    fn task_finished(&self, task: &RawTask) {
        match task.state() {
            TaskState::Completed => self.tasks_completed.fetch_add(1, Ordering::Relaxed),
            _ => self.tasks_failed.fetch_add(1, Ordering::Relaxed),
        };
        let mut tasks = self.tasks.lock();
        if tasks.remove(&task.id()).is_some() && tasks.is_empty() {
            self.idle.notify_all();
        }
    }

    fn handle(&self) -> Option<Handle> {
        self.me.upgrade().map(Handle::from_shared)
    }
}

/// Cooperative front-end above the pool
///
/// Converts timer expiry and event signals into task resumptions. Owns the
/// worker and timer threads; dropping a running scheduler stops it with
/// `force = true`.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Create a scheduler. Nothing runs until [`start`](Self::start).
    pub fn new(config: RuntimeConfig) -> Self {
        let workers = config.effective_pool_size();
        let shared = Arc::new_cyclic(|me| SchedulerShared {
            config,
            state: Mutex::new(SchedulerState::Init),
            pool: Pool::new(workers),
            timer: TimerThread::new(),
            tasks: Mutex::new(FxHashMap::default()),
            idle: Condvar::new(),
            stop_requests: Mutex::new(None),
            tasks_spawned: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            me: me.clone(),
        });
        Self { shared }
    }

    /// Create a scheduler with `worker_count` workers (0 = number of CPU cores)
    pub fn with_workers(worker_count: usize) -> Self {
        Self::new(RuntimeConfig::default().with_pool_size(worker_count))
    }

    /// Spawn the worker and timer threads (Init -> Running)
    pub fn start(&self) -> Result<()> {
        self.shared.start()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    /// Submit a task for immediate execution (round-robin onto the pool)
    pub fn add_task<T>(&self, task: &Task<T>) -> Result<()> {
        self.shared.add_task(task.raw())
    }

    /// Submit a task once `delay` has elapsed
    pub fn add_timer<T>(&self, delay: Duration, task: &Task<T>) -> Result<()> {
        self.shared.add_timer(delay, task.raw())
    }

    /// Stop the scheduler (Running -> Draining -> Stopped).
    ///
    /// With `force = false`, blocks until every live task has finished,
    /// then joins the workers. With `force = true`, pending timers and
    /// queued tasks are abandoned and never resumed. Must not be called from
    /// inside one of this scheduler's tasks; use [`Handle::stop`] there.
    pub fn stop(&self, force: bool) {
        self.shared.stop(force);
    }

    /// Block until no live tasks remain or `timeout` elapses
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.wait_idle(timeout)
    }

    /// Cloneable handle for submitting work and requesting shutdown
    pub fn handle(&self) -> Handle {
        Handle::from_shared(self.shared.clone())
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.shared.pool.size()
    }

    /// Number of live tasks
    pub fn task_count(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Number of pending timers
    pub fn timer_count(&self) -> usize {
        self.shared.timer.pending()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }

    /// Per-worker queue statistics
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.shared.pool_stats()
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.set_stop_requests(None);
        if matches!(
            self.shared.state(),
            SchedulerState::Init | SchedulerState::Running
        ) {
            self.shared.stop(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::{sleep, SleepUntil};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::with_workers(4);
        assert_eq!(scheduler.worker_count(), 4);
        assert_eq!(scheduler.state(), SchedulerState::Init);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_scheduler_default_workers() {
        let scheduler = Scheduler::with_workers(0);
        assert_eq!(scheduler.worker_count(), num_cpus::get());
    }

    #[test]
    fn test_scheduler_start_stop() {
        let scheduler = Scheduler::with_workers(2);
        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.stop(false);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(matches!(scheduler.start(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_add_task_runs_and_counts() {
        let scheduler = Scheduler::with_workers(2);
        scheduler.start().unwrap();

        let task = Task::new(async { Ok(6 * 7) });
        scheduler.add_task(&task).unwrap();
        assert!(matches!(scheduler.add_task(&task), Err(Error::InvalidState(_))));
        assert_eq!(task.join().unwrap(), 42);

        assert!(scheduler.wait_idle(Duration::from_secs(1)));
        let stats = scheduler.stats();
        assert_eq!(stats.tasks_spawned, 1);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.active_tasks, 0);
        scheduler.stop(false);
    }

    #[test]
    fn test_add_timer_defers_submission() {
        let scheduler = Scheduler::with_workers(1);
        scheduler.start().unwrap();

        let started = Instant::now();
        let task = Task::new(async move { Ok(started.elapsed()) });
        scheduler.add_timer(Duration::from_millis(50), &task).unwrap();
        assert_eq!(scheduler.timer_count(), 1);
        assert_eq!(task.state(), TaskState::Suspended);

        let elapsed = task.join().unwrap();
        assert!(elapsed >= Duration::from_millis(50));
        scheduler.stop(false);
    }

    #[test]
    fn test_failed_task_counted() {
        let scheduler = Scheduler::with_workers(1);
        scheduler.start().unwrap();
        let task: Task<()> = Task::new(async { Err(Error::user("bad")) });
        scheduler.add_task(&task).unwrap();
        assert!(task.join().is_err());
        assert!(scheduler.wait_idle(Duration::from_secs(1)));
        assert_eq!(scheduler.stats().tasks_failed, 1);
        scheduler.stop(false);
    }

    #[test]
    fn test_graceful_stop_waits_for_sleepers() {
        let scheduler = Scheduler::with_workers(1);
        scheduler.start().unwrap();
        let task = Task::new(async {
            sleep(Duration::from_millis(40)).await?;
            Ok("woke")
        });
        let handle = task.handle();
        scheduler.add_task(&task).unwrap();

        scheduler.stop(false);
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(task.try_take().unwrap().unwrap(), "woke");
    }

    #[test]
    fn test_forced_stop_abandons_sleepers() {
        let scheduler = Scheduler::with_workers(1);
        scheduler.start().unwrap();
        let task: Task<()> = Task::new(async {
            sleep(Duration::from_secs(30)).await?;
            Ok(())
        });
        scheduler.add_task(&task).unwrap();
        while task.state() != TaskState::Suspended {
            thread::sleep(Duration::from_millis(1));
        }

        scheduler.stop(true);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(task.state(), TaskState::Suspended);
        assert_eq!(scheduler.timer_count(), 0);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_forced_stop_during_resume_leaves_no_timer() {
        let scheduler = Arc::new(Scheduler::with_workers(1));
        scheduler.start().unwrap();
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let task: Task<()> = {
            let entered = entered.clone();
            let release = release.clone();
            Task::new(async move {
                entered.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                // Registers a timer on this task after the stop has begun
                SleepUntil::new(Instant::now() + Duration::from_secs(30)).await?;
                Ok(())
            })
        };
        scheduler.add_task(&task).unwrap();
        while !entered.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        let stopper = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.stop(true))
        };
        thread::sleep(Duration::from_millis(20));
        release.store(true, Ordering::SeqCst);
        stopper.join().unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(task.state(), TaskState::Suspended);
        assert_eq!(scheduler.timer_count(), 0);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_submissions_closed_after_stop() {
        let scheduler = Scheduler::with_workers(1);
        scheduler.start().unwrap();
        scheduler.stop(false);
        let task = Task::new(async { Ok(()) });
        assert!(matches!(scheduler.add_task(&task), Err(Error::InvalidState(_))));
        assert_eq!(task.state(), TaskState::Created);
    }
}
