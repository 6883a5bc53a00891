//! Pinc cooperative task runtime
//!
//! This crate provides a small cooperative scheduling runtime:
//! - **Future**: single-assignment result cell (`future` module)
//! - **Task**: lazy, resumable unit of work producing into a Future (`task` module)
//! - **Scheduler**: round-robin worker pool plus a timer thread (`scheduler` module)
//! - **Sync**: `Event` and `Condition` signals tasks can wait on (`sync` module)
//! - **Combinators**: `sleep`, `gather`, `to_thread`, `wait_until`, `wait_for`,
//!   and the blocking `sync` bridge
//!
//! # Example
//!
//! ```rust,ignore
//! use pinc::{gather, sleep, start, Task};
//! use std::time::Duration;
//!
//! let root = Task::new(async {
//!     gather(vec![sleep(Duration::from_secs(1)), sleep(Duration::from_secs(2))]).await?;
//!     Ok(())
//! });
//!
//! // Returns after ~2s with exit code 0
//! let code = start(root, 2);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

mod combinator;
mod config;
mod context;
mod error;
mod future;
mod local;
mod pool;
mod runtime;
mod scheduler;
pub mod sync;
mod task;
mod timer;
mod worker;

// ============================================================================
// Re-exports
// ============================================================================

pub use combinator::{
    add_task, gather, sleep, sleep_until, to_thread, wait_for, wait_until, yield_now, YieldNow,
};
pub use config::{RuntimeConfig, ENV_DRAIN_ON_EXIT, ENV_POOL_SIZE, ENV_THREAD_NAME_PREFIX};
pub use error::{Error, Result};
pub use future::{Future, FutureState};
pub use local::sync;
pub use pool::PoolStats;
pub use runtime::{start, stop, Handle, Runtime, EXIT_ABORTED, EXIT_FAILURE, EXIT_SUCCESS};
pub use scheduler::{Scheduler, SchedulerState, SchedulerStats};
pub use sync::{Condition, Event, Signal};
pub use task::{SuspendReason, Task, TaskHandle, TaskId, TaskJoin, TaskState};
