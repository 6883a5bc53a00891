//! Single-assignment result cells
//!
//! A [`Future`] starts `Pending` and transitions exactly once to `Resolved`
//! or `Failed`. The transition is claimed with an atomic compare-and-set so
//! racing producers cannot both write; the payload is then published under
//! the slot lock, which is also what blocked readers and registered wakers
//! synchronise on.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
/// Claimed by a producer, payload not yet visible
const SETTING: u8 = 1;
const RESOLVED: u8 = 2;
const FAILED: u8 = 3;

/// Observable state of a [`Future`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FutureState {
    /// No value yet
    Pending,
    /// Holds a value
    Resolved,
    /// Holds an error
    Failed,
}

/// Single-assignment result cell with completion and error state
pub struct Future<T> {
    state: AtomicU8,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

struct Slot<T> {
    value: Option<T>,
    error: Option<Error>,
    /// The value was moved out by the owning task handle
    consumed: bool,
    /// Wakers of async readers, woken in registration order
    waiters: Vec<Waker>,
}

impl<T> Future<T> {
    /// Create a pending future
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            slot: Mutex::new(Slot {
                value: None,
                error: None,
                consumed: false,
                waiters: Vec::new(),
            }),
            ready: Condvar::new(),
        }
    }

    /// Current state (a claimed-but-unpublished future still reads as Pending)
    pub fn state(&self) -> FutureState {
        match self.state.load(Ordering::Acquire) {
            RESOLVED => FutureState::Resolved,
            FAILED => FutureState::Failed,
            _ => FutureState::Pending,
        }
    }

    /// Non-blocking, side-effect-free peek: true once resolved or failed
    pub fn is_available(&self) -> bool {
        self.state() != FutureState::Pending
    }

    /// Resolve with a value. Fails with `InvalidState` if already completed.
    pub fn set_value(&self, value: T) -> Result<()> {
        self.claim()?;
        let waiters = {
            let mut slot = self.slot.lock();
            slot.value = Some(value);
            self.state.store(RESOLVED, Ordering::Release);
            std::mem::take(&mut slot.waiters)
        };
        self.publish(waiters);
        Ok(())
    }

    /// Fail with an error. Fails with `InvalidState` if already completed.
    pub fn set_exception(&self, error: Error) -> Result<()> {
        self.claim()?;
        let waiters = {
            let mut slot = self.slot.lock();
            slot.error = Some(error);
            self.state.store(FAILED, Ordering::Release);
            std::mem::take(&mut slot.waiters)
        };
        self.publish(waiters);
        Ok(())
    }

    /// Resolve or fail from a `Result`
    pub fn set_result(&self, result: Result<T>) -> Result<()> {
        match result {
            Ok(value) => self.set_value(value),
            Err(error) => self.set_exception(error),
        }
    }

    fn claim(&self) -> Result<()> {
        self.state
            .compare_exchange(PENDING, SETTING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::InvalidState("future already completed".to_string()))
    }

    fn publish(&self, waiters: Vec<Waker>) {
        self.ready.notify_all();
        for waker in waiters {
            waker.wake();
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), RESOLVED | FAILED)
    }

    /// Block the calling thread until the future completes
    pub fn wait(&self) {
        let mut slot = self.slot.lock();
        while !self.is_terminal() {
            self.ready.wait(&mut slot);
        }
    }

    /// Block until the future completes or `timeout` elapses.
    /// Returns true if the future completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while !self.is_terminal() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                return self.is_terminal();
            }
        }
        true
    }

    /// The stored error, if the future failed
    pub fn error(&self) -> Option<Error> {
        if self.state.load(Ordering::Acquire) != FAILED {
            return None;
        }
        self.slot.lock().error.clone()
    }

    /// Number of async readers currently registered
    pub fn waiter_count(&self) -> usize {
        self.slot.lock().waiters.len()
    }

    /// Move the outcome out without blocking. `None` while pending.
    pub(crate) fn take(&self) -> Option<Result<T>> {
        if !self.is_terminal() {
            return None;
        }
        Some(self.take_locked(&mut self.slot.lock()))
    }

    /// Move the outcome out, or register `waker` to be woken on completion
    pub(crate) fn poll_take(&self, waker: &Waker) -> Poll<Result<T>> {
        let mut slot = self.slot.lock();
        if self.is_terminal() {
            return Poll::Ready(self.take_locked(&mut slot));
        }
        register(&mut slot.waiters, waker);
        Poll::Pending
    }

    /// Register `waker` unless the future is already complete.
    /// Returns true if it was already complete.
    pub(crate) fn register_waker(&self, waker: &Waker) -> bool {
        let mut slot = self.slot.lock();
        if self.is_terminal() {
            return true;
        }
        register(&mut slot.waiters, waker);
        false
    }

    fn take_locked(&self, slot: &mut Slot<T>) -> Result<T> {
        match self.state.load(Ordering::Acquire) {
            FAILED => Err(slot.error.clone().unwrap_or(Error::Cancelled)),
            _ => match slot.value.take() {
                Some(value) => {
                    slot.consumed = true;
                    Ok(value)
                }
                None => Err(Error::InvalidState("future value already consumed".to_string())),
            },
        }
    }
}

impl<T: Clone> Future<T> {
    /// Block until complete, then return a copy of the value or the error
    pub fn get_value(&self) -> Result<T> {
        self.wait();
        self.read()
    }

    /// Non-blocking read. `None` while pending.
    pub fn try_get_value(&self) -> Option<Result<T>> {
        if !self.is_terminal() {
            return None;
        }
        Some(self.read())
    }

    fn read(&self) -> Result<T> {
        let slot = self.slot.lock();
        match self.state.load(Ordering::Acquire) {
            FAILED => Err(slot.error.clone().unwrap_or(Error::Cancelled)),
            _ => match &slot.value {
                Some(value) => Ok(value.clone()),
                None if slot.consumed => Err(Error::InvalidState("future value already consumed".to_string())),
                None => Err(Error::InvalidState("future is pending".to_string())),
            },
        }
    }
}

fn register(waiters: &mut Vec<Waker>, waker: &Waker) {
    if !waiters.iter().any(|w| w.will_wake(waker)) {
        waiters.push(waker.clone());
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").field("state", &self.state()).finish()
    }
}
