//! Re-armable multi-waiter event

use super::Signal;
use crate::context;
use crate::error::Result;
use crate::task::{SuspendReason, Task};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct EventState {
    signaled: bool,
    /// Bumped by every `set`; a waiter registered at an older generation
    /// has been released even if the event was cleared since
    generation: u64,
    next_token: u64,
    waiters: Vec<(u64, Waker)>,
}

/// Single-bit, multi-waiter, re-armable signal
///
/// `set()` releases every current waiter and keeps the event signaled so
/// later waiters pass straight through, until `clear()` re-arms it.
/// Clones share the same underlying event.
#[derive(Clone, Default)]
pub struct Event {
    state: Arc<Mutex<EventState>>,
}

impl Event {
    /// Create an unsignaled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking all waiters in registration order.
    /// Returns the number of waiters woken.
    pub fn set(&self) -> usize {
        let waiters = {
            let mut state = self.state.lock();
            state.signaled = true;
            state.generation += 1;
            std::mem::take(&mut state.waiters)
        };
        let woken = waiters.len();
        for (_, waker) in waiters {
            waker.wake();
        }
        woken
    }

    /// Re-arm the event
    pub fn clear(&self) {
        self.state.lock().signaled = false;
    }

    /// Is the event currently signaled?
    pub fn is_set(&self) -> bool {
        self.state.lock().signaled
    }

    /// Number of suspended waiters
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Suspension point: resolves once the event is set
    pub fn wait_for_set(&self) -> EventWait {
        EventWait {
            state: self.state.clone(),
            registered: None,
        }
    }

    /// A task that completes once the event is set
    pub fn wait(&self) -> Task<()> {
        let wait = self.wait_for_set();
        Task::named("event-wait", async move { wait.await })
    }
}

impl Signal for Event {
    fn wait(&self) -> Task<()> {
        Event::wait(self)
    }

    fn is_ready(&self) -> bool {
        self.is_set()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Event")
            .field("signaled", &state.signaled)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Future returned by [`Event::wait_for_set`]
pub struct EventWait {
    state: Arc<Mutex<EventState>>,
    /// (token, generation at registration)
    registered: Option<(u64, u64)>,
}

impl StdFuture for EventWait {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = &mut *self;
        let mut state = this.state.lock();
        match this.registered {
            Some((_, generation)) if state.generation != generation => {
                this.registered = None;
                return Poll::Ready(Ok(()));
            }
            None if state.signaled => return Poll::Ready(Ok(())),
            Some((token, _)) => {
                if let Some(entry) = state.waiters.iter_mut().find(|(t, _)| *t == token) {
                    entry.1.clone_from(cx.waker());
                }
            }
            None => {
                let token = state.next_token;
                state.next_token += 1;
                state.waiters.push((token, cx.waker().clone()));
                this.registered = Some((token, state.generation));
            }
        }
        drop(state);
        context::set_suspend_reason(SuspendReason::WaitEvent);
        Poll::Pending
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        if let Some((token, _)) = self.registered.take() {
            self.state.lock().waiters.retain(|(t, _)| *t != token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::QueueDriver;
    use crate::task::TaskState;

    #[test]
    fn test_event_starts_clear() {
        let event = Event::new();
        assert!(!event.is_set());
        assert!(!event.is_ready());
        assert_eq!(event.set(), 0);
        assert!(event.is_set());
        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn test_set_wakes_all_waiters() {
        let driver = QueueDriver::new();
        let event = Event::new();
        let waiters: Vec<_> = (0..3).map(|_| event.wait()).collect();
        for w in &waiters {
            w.raw().submit(driver.clone());
        }
        driver.run_until_idle();
        assert_eq!(event.waiter_count(), 3);
        assert!(waiters.iter().all(|w| w.state() == TaskState::Suspended));
        assert_eq!(waiters[0].suspend_reason(), Some(SuspendReason::WaitEvent));

        assert_eq!(event.set(), 3);
        assert_eq!(event.waiter_count(), 0);
        assert!(waiters.iter().all(|w| w.state() == TaskState::Ready));
        driver.run_until_idle();
        assert!(waiters.iter().all(|w| w.state() == TaskState::Completed));
    }

    #[test]
    fn test_signaled_event_passes_through() {
        let driver = QueueDriver::new();
        let event = Event::new();
        event.set();
        let task = event.wait();
        task.raw().submit(driver.clone());
        assert_eq!(driver.run_until_idle(), 1);
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn test_set_then_clear_still_releases_waiter() {
        let driver = QueueDriver::new();
        let event = Event::new();
        let task = event.wait();
        task.raw().submit(driver.clone());
        driver.run_until_idle();

        event.set();
        event.clear();
        driver.run_until_idle();
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn test_cancelled_waiter_is_removed() {
        let driver = QueueDriver::new();
        let event = Event::new();
        let task = event.wait();
        task.raw().submit(driver.clone());
        driver.run_until_idle();
        assert_eq!(event.waiter_count(), 1);

        task.cancel();
        assert_eq!(event.waiter_count(), 0);
        assert_eq!(event.set(), 0);
    }
}
