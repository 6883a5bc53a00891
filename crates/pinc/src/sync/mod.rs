//! Signalling primitives that tasks can wait on
//!
//! Neither primitive blocks a thread: a waiting task is suspended and its
//! waker is parked in the primitive's waiter list until the signal fires.
//!
//! Each `Event` and `Condition` guards its waiter list with its own lock.
//! There is no scheduler-wide wait set, and the timer queue has a separate
//! lock of its own.

mod condition;
mod event;

pub use condition::{Condition, ConditionWait};
pub use event::{Event, EventWait};

use crate::task::Task;

/// Something a task can wait for
pub trait Signal {
    /// A task that completes once the signal fires
    fn wait(&self) -> Task<()>;

    /// Non-blocking check: would a waiter complete right now?
    fn is_ready(&self) -> bool;
}
