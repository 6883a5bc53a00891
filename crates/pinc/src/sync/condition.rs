//! Predicate-gated multi-waiter signal

use super::Signal;
use crate::context;
use crate::error::Result;
use crate::task::{SuspendReason, Task};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

struct Waiter {
    token: u64,
    predicate: Predicate,
    waker: Waker,
    released: Arc<AtomicBool>,
}

#[derive(Default)]
struct Waiters {
    next_token: u64,
    list: Vec<Waiter>,
}

struct Inner {
    predicate: Predicate,
    waiters: Mutex<Waiters>,
}

/// Predicate-gated signal
///
/// Waiters stay registered until their predicate holds at a
/// [`notify`](Condition::notify). Predicates are evaluated under the
/// condition's lock and must not call back into the same condition.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<Inner>,
}

impl Condition {
    /// Create a condition gated by `predicate`
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                predicate: Arc::new(predicate),
                waiters: Mutex::new(Waiters::default()),
            }),
        }
    }

    /// Evaluate the condition's predicate now
    pub fn is_satisfied(&self) -> bool {
        (self.inner.predicate)()
    }

    /// Re-check every waiter's predicate after a relevant state change.
    /// Satisfied waiters are woken (in registration order) and removed; the
    /// rest stay registered. Returns the number woken.
    pub fn notify(&self) -> usize {
        let released: Vec<Waker> = {
            let mut waiters = self.inner.waiters.lock();
            let mut woken = Vec::new();
            waiters.list.retain(|waiter| {
                if (waiter.predicate)() {
                    waiter.released.store(true, Ordering::Release);
                    woken.push(waiter.waker.clone());
                    false
                } else {
                    true
                }
            });
            woken
        };
        let count = released.len();
        for waker in released {
            waker.wake();
        }
        count
    }

    /// Number of suspended waiters
    pub fn waiter_count(&self) -> usize {
        self.inner.waiters.lock().list.len()
    }

    /// Suspension point gated by the condition's own predicate
    pub fn wait_until_satisfied(&self) -> ConditionWait {
        self.wait_until_with(self.inner.predicate.clone())
    }

    fn wait_until_with(&self, predicate: Predicate) -> ConditionWait {
        ConditionWait {
            inner: self.inner.clone(),
            predicate,
            registered: None,
        }
    }

    /// A task that completes once the condition's predicate holds
    pub fn wait(&self) -> Task<()> {
        let wait = self.wait_until_satisfied();
        Task::named("condition-wait", async move { wait.await })
    }

    /// A task that completes once `predicate` holds at a `notify`
    pub fn wait_with<F>(&self, predicate: F) -> Task<()>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let wait = self.wait_until_with(Arc::new(predicate));
        Task::named("condition-wait", async move { wait.await })
    }
}

impl Signal for Condition {
    fn wait(&self) -> Task<()> {
        Condition::wait(self)
    }

    fn is_ready(&self) -> bool {
        self.is_satisfied()
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

/// Future returned by [`Condition::wait_until_satisfied`]
pub struct ConditionWait {
    inner: Arc<Inner>,
    predicate: Predicate,
    registered: Option<(u64, Arc<AtomicBool>)>,
}

impl StdFuture for ConditionWait {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = &mut *self;
        let mut waiters = this.inner.waiters.lock();
        let registered = this
            .registered
            .as_ref()
            .map(|(token, released)| (*token, released.load(Ordering::Acquire)));
        match registered {
            Some((_, true)) => {
                this.registered = None;
                return Poll::Ready(Ok(()));
            }
            Some((token, false)) => {
                if let Some(waiter) = waiters.list.iter_mut().find(|w| w.token == token) {
                    waiter.waker.clone_from(cx.waker());
                }
            }
            None => {
                if (this.predicate)() {
                    return Poll::Ready(Ok(()));
                }
                let token = waiters.next_token;
                waiters.next_token += 1;
                let released = Arc::new(AtomicBool::new(false));
                waiters.list.push(Waiter {
                    token,
                    predicate: this.predicate.clone(),
                    waker: cx.waker().clone(),
                    released: released.clone(),
                });
                this.registered = Some((token, released));
            }
        }
        drop(waiters);
        context::set_suspend_reason(SuspendReason::WaitCondition);
        Poll::Pending
    }
}

impl Drop for ConditionWait {
    fn drop(&mut self) {
        if let Some((token, _)) = self.registered.take() {
            self.inner.waiters.lock().list.retain(|w| w.token != token);
        }
    }
}
