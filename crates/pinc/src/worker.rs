//! Worker thread that resumes tasks from its private queue

use crate::error::Result;
use crate::pool::PoolShared;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

/// Worker thread that executes tasks
pub(crate) struct Worker {
    /// Worker ID (index of its queue)
    id: usize,

    /// Worker thread handle
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread
    pub(crate) fn start(id: usize, name: String, shared: Arc<PoolShared>) -> Result<Self> {
        let handle = thread::Builder::new().name(name).spawn(move || {
            Worker::run_loop(id, &shared);
        })?;
        Ok(Self {
            id,
            handle: Some(handle),
        })
    }

    /// Wait for the thread to exit. Does nothing when called from the worker itself.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("worker {} terminated abnormally", self.id);
            }
        }
    }

    /// Worker thread main loop
    fn run_loop(id: usize, shared: &PoolShared) {
        log::debug!("worker {} started", id);
        let queue = &shared.queues[id];
        loop {
            let task = {
                let mut jobs = queue.jobs.lock();
                loop {
                    if shared.abandon.load(Ordering::SeqCst) {
                        log::debug!("worker {} abandoning {} queued tasks", id, jobs.len());
                        return;
                    }
                    if let Some(task) = jobs.pop_front() {
                        break task;
                    }
                    if shared.interrupt.load(Ordering::SeqCst) {
                        log::debug!("worker {} drained, exiting", id);
                        return;
                    }
                    queue.available.wait(&mut jobs);
                }
            };

            log::trace!("worker {} resuming task {}", id, task.id());
            // Failures are captured into the task's Future by resume()
            let state = task.resume();
            queue.executed.fetch_add(1, Ordering::Relaxed);
            log::trace!("worker {} left task {} {:?}", id, task.id(), state);
        }
    }
}
