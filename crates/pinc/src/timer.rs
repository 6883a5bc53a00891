//! Timer queue and timer thread
//!
//! Sleeping tasks and deferred submissions are kept in a queue ordered by
//! expiry. The timer thread waits on a condvar for the earliest deadline
//! (waking early when an earlier entry arrives) and makes expired tasks
//! ready again.

use crate::error::Result;
use crate::task::RawTask;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifies one timer entry. Orders by expiry, then by insertion.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerKey {
    wake_at: Instant,
    seq: u64,
}

impl TimerKey {
    pub(crate) fn wake_at(&self) -> Instant {
        self.wake_at
    }
}

/// Tasks waiting for a point in time
pub(crate) struct TimerQueue {
    entries: BTreeMap<TimerKey, Arc<RawTask>>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Add an entry. The flag is true if it is now the earliest one.
    pub(crate) fn insert(&mut self, wake_at: Instant, task: Arc<RawTask>) -> (TimerKey, bool) {
        let key = TimerKey {
            wake_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, task);
        let earliest = self.entries.keys().next() == Some(&key);
        (key, earliest)
    }

    pub(crate) fn remove(&mut self, key: TimerKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(TimerKey::wake_at)
    }

    /// Remove and return every entry due at `now`, earliest first
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<Arc<RawTask>> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().wake_at > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries, returning the tasks that were waiting
    pub(crate) fn clear(&mut self) -> Vec<Arc<RawTask>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer thread for sleep and deferred-submission handling
pub(crate) struct TimerThread {
    queue: Mutex<TimerQueue>,
    /// Wakes the timer thread when an earlier entry is added or on shutdown
    notify: Condvar,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(TimerQueue::new()),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the timer thread
    pub(crate) fn start(self: &Arc<Self>, name: String) -> Result<()> {
        let timer = Arc::clone(self);
        let handle = thread::Builder::new().name(name).spawn(move || {
            timer.run_loop();
        })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the timer thread. Pending entries stay queued until `clear`.
    pub(crate) fn stop(&self) {
        {
            let queue = self.queue.lock();
            self.shutdown.store(true, Ordering::Release);
            if !queue.is_empty() {
                log::debug!("timer thread stopping with {} pending entries", queue.len());
            }
        }
        self.notify.notify_one();

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > timeout {
                    log::warn!("timer thread did not exit within {:?}", timeout);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Wake `task` once `wake_at` has passed
    pub(crate) fn register(&self, wake_at: Instant, task: Arc<RawTask>) -> TimerKey {
        let (key, earliest) = self.queue.lock().insert(wake_at, task);
        if earliest {
            self.notify.notify_one();
        }
        key
    }

    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        self.queue.lock().remove(key)
    }

    /// Drop every pending entry, returning the tasks that were waiting
    pub(crate) fn clear(&self) -> Vec<Arc<RawTask>> {
        self.queue.lock().clear()
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn run_loop(&self) {
        log::debug!("timer thread started");
        loop {
            let mut queue = self.queue.lock();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let expired = queue.pop_expired(Instant::now());
            if !expired.is_empty() {
                drop(queue);
                // Wake outside the lock: rescheduling may push to worker queues
                for task in expired {
                    task.wake_task();
                }
                continue;
            }

            match queue.next_deadline() {
                Some(deadline) => {
                    self.notify.wait_until(&mut queue, deadline);
                }
                None => self.notify.wait(&mut queue),
            }
        }
        log::debug!("timer thread shutting down");
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop();
    }
}
