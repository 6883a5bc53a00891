//! Fixed-size worker pool with private per-worker queues
//!
//! Submissions are dispatched round-robin. A task is pinned to the worker
//! that first received it, so every later resumption of that task (after a
//! sleep, an await, an event) lands on the same queue and is therefore
//! serialized by that worker. There is no stealing between workers.

use crate::error::Result;
use crate::task::RawTask;
use crate::worker::Worker;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-worker queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker index
    pub worker: usize,
    /// Tasks waiting in this worker's queue
    pub queued: usize,
    /// Resumptions performed by this worker
    pub executed: u64,
}

/// One worker's private FIFO and the condvar it sleeps on
pub(crate) struct WorkerQueue {
    pub(crate) jobs: Mutex<VecDeque<Arc<RawTask>>>,
    pub(crate) available: Condvar,
    pub(crate) executed: AtomicU64,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            executed: AtomicU64::new(0),
        }
    }
}

/// State shared between the pool and its worker threads
pub(crate) struct PoolShared {
    pub(crate) queues: Vec<WorkerQueue>,
    /// Stop requested; workers exit once their queue is empty
    pub(crate) interrupt: AtomicBool,
    /// Forced stop; workers exit without draining
    pub(crate) abandon: AtomicBool,
}

/// Round-robin thread pool
pub(crate) struct Pool {
    shared: Arc<PoolShared>,
    cursor: AtomicUsize,
    workers: Mutex<Vec<Worker>>,
}

impl Pool {
    /// Create a pool with `size` queues (at least one). No threads run until `start`.
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            shared: Arc::new(PoolShared {
                queues: (0..size).map(|_| WorkerQueue::new()).collect(),
                interrupt: AtomicBool::new(false),
                abandon: AtomicBool::new(false),
            }),
            cursor: AtomicUsize::new(0),
            workers: Mutex::new(Vec::with_capacity(size)),
        }
    }

    /// Spawn one thread per queue, named `{prefix}-worker-{k}`
    pub(crate) fn start(&self, prefix: &str) -> Result<()> {
        let mut workers = self.workers.lock();
        for id in workers.len()..self.size() {
            let name = format!("{}-worker-{}", prefix, id);
            workers.push(Worker::start(id, name, self.shared.clone())?);
        }
        log::debug!("pool started with {} workers", workers.len());
        Ok(())
    }

    pub(crate) fn size(&self) -> usize {
        self.shared.queues.len()
    }

    /// Queue `task` on its pinned worker, pinning it round-robin on first
    /// submission. Returns the worker index, or `None` if the pool is stopping.
    pub(crate) fn submit(&self, task: Arc<RawTask>) -> Option<usize> {
        let k = match task.worker() {
            Some(k) => k,
            None => {
                let next = self.cursor.fetch_add(1, Ordering::Relaxed) % self.size();
                task.assign_worker(next)
            }
        };
        let queue = &self.shared.queues[k];
        {
            let mut jobs = queue.jobs.lock();
            if self.shared.interrupt.load(Ordering::SeqCst) {
                drop(jobs);
                log::warn!("pool is stopping; dropping task {}", task.id());
                return None;
            }
            jobs.push_back(task);
        }
        queue.available.notify_one();
        Some(k)
    }

    /// Stop the workers.
    ///
    /// Without `force`, each worker finishes its queue before exiting. With
    /// `force`, queued tasks are abandoned and returned. Joins every worker
    /// except the calling thread.
    pub(crate) fn stop(&self, force: bool) -> Vec<Arc<RawTask>> {
        let mut abandoned = Vec::new();
        for queue in &self.shared.queues {
            // Flags flip under each queue lock so `submit` cannot push past the drain
            let mut jobs = queue.jobs.lock();
            if force {
                self.shared.abandon.store(true, Ordering::SeqCst);
                abandoned.extend(jobs.drain(..));
            }
            self.shared.interrupt.store(true, Ordering::SeqCst);
            drop(jobs);
            queue.available.notify_all();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for mut worker in workers {
            worker.join();
        }
        log::debug!(
            "pool stopped (force: {}, abandoned: {})",
            force,
            abandoned.len()
        );
        abandoned
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.interrupt.load(Ordering::SeqCst)
    }

    pub(crate) fn stats(&self) -> Vec<PoolStats> {
        self.shared
            .queues
            .iter()
            .enumerate()
            .map(|(worker, queue)| PoolStats {
                worker,
                queued: queue.jobs.lock().len(),
                executed: queue.executed.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Driver;
    use crate::runtime::Handle;
    use crate::task::{Task, TaskState};
    use crate::timer::{TimerKey, TimerQueue};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Driver that feeds a bare pool
    struct PoolDriver {
        pool: Pool,
        timers: Mutex<TimerQueue>,
    }

    impl Driver for PoolDriver {
        fn schedule(&self, task: Arc<RawTask>) {
            self.pool.submit(task);
        }
        fn add_timer(&self, wake_at: Instant, task: Arc<RawTask>) -> TimerKey {
            self.timers.lock().insert(wake_at, task).0
        }
        fn cancel_timer(&self, key: TimerKey) -> bool {
            self.timers.lock().remove(key)
        }
        fn task_started(&self, _task: &Arc<RawTask>) {}
        fn task_finished(&self, _task: &RawTask) {}
        fn handle(&self) -> Option<Handle> {
            None
        }
    }

    fn pool_driver(size: usize) -> Arc<PoolDriver> {
        Arc::new(PoolDriver {
            pool: Pool::new(size),
            timers: Mutex::new(TimerQueue::new()),
        })
    }

    #[test]
    fn test_round_robin_assignment() {
        let driver = pool_driver(3);
        // Not started: submissions only queue
        let tasks: Vec<Task<()>> = (0..7).map(|_| Task::new(async { Ok(()) })).collect();
        for task in &tasks {
            task.raw().submit(driver.clone());
        }
        let assigned: Vec<_> = tasks.iter().map(|t| t.raw().worker().unwrap()).collect();
        assert_eq!(assigned, vec![0, 1, 2, 0, 1, 2, 0]);

        let queued: Vec<_> = driver.pool.stats().iter().map(|s| s.queued).collect();
        assert_eq!(queued, vec![3, 2, 2]);
        driver.pool.stop(true);
    }

    #[test]
    fn test_workers_run_tasks() {
        let driver = pool_driver(2);
        driver.pool.start("pinc-test").unwrap();

        let tasks: Vec<Task<usize>> = (0..10).map(|i| Task::new(async move { Ok(i * 2) })).collect();
        for task in &tasks {
            task.raw().submit(driver.clone());
        }
        let results: Vec<_> = tasks.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());

        driver.pool.stop(false);
        let executed: u64 = driver.pool.stats().iter().map(|s| s.executed).sum();
        assert_eq!(executed, 10);
    }

    #[test]
    fn test_worker_thread_names() {
        let driver = pool_driver(1);
        driver.pool.start("named").unwrap();
        let task = Task::new(async { Ok(thread::current().name().map(str::to_string)) });
        task.raw().submit(driver.clone());
        assert_eq!(task.join().unwrap().as_deref(), Some("named-worker-0"));
        driver.pool.stop(false);
    }

    #[test]
    fn test_failing_task_does_not_kill_worker() {
        let driver = pool_driver(1);
        driver.pool.start("pinc-test").unwrap();

        let bad: Task<()> = Task::new(async {
            if true {
                panic!("worker must survive this");
            }
            Ok(())
        });
        bad.raw().submit(driver.clone());
        let good = Task::new(async { Ok(1) });
        good.raw().submit(driver.clone());

        assert!(bad.join().is_err());
        assert_eq!(good.join().unwrap(), 1);
        driver.pool.stop(false);
    }

    #[test]
    fn test_graceful_stop_drains_queue() {
        let driver = pool_driver(1);
        let tasks: Vec<Task<()>> = (0..5)
            .map(|_| {
                Task::new(async {
                    thread::sleep(Duration::from_millis(5));
                    Ok(())
                })
            })
            .collect();
        for task in &tasks {
            task.raw().submit(driver.clone());
        }
        driver.pool.start("pinc-test").unwrap();
        assert!(driver.pool.stop(false).is_empty());
        assert!(tasks.iter().all(|t| t.state() == TaskState::Completed));
    }

    #[test]
    fn test_forced_stop_abandons_queue() {
        let driver = pool_driver(1);
        let tasks: Vec<Task<()>> = (0..4).map(|_| Task::new(async { Ok(()) })).collect();
        for task in &tasks {
            task.raw().submit(driver.clone());
        }
        // Never started, so nothing runs before the forced stop
        let abandoned = driver.pool.stop(true);
        assert_eq!(abandoned.len(), 4);
        assert!(tasks.iter().all(|t| t.state() == TaskState::Ready));

        let late = Task::new(async { Ok(()) });
        late.raw().submit(driver.clone());
        assert_eq!(driver.pool.stats()[0].queued, 0);
    }
}
