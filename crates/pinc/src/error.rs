//! Error taxonomy shared by futures, tasks and the runtime

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the runtime or captured from task bodies
///
/// `Error` is `Clone` so that a failed [`Future`](crate::Future) can hand the
/// same error to every reader.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Operation not allowed in the current state (double-set of a Future,
    /// reading a consumed value)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The task was cancelled before it could finish
    #[error("Task cancelled")]
    Cancelled,

    /// A `wait_until` deadline elapsed before the guarded task finished
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The task body panicked; the payload message is preserved
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// A suspension point was reached with no scheduler bound to the task
    #[error("No runtime available: {0}")]
    NoRuntime(&'static str),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker or timer thread could not be spawned
    #[error("Failed to spawn thread: {0}")]
    Spawn(Arc<std::io::Error>),

    /// Error raised by user code inside a task body
    #[error("{0}")]
    User(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an arbitrary user error (or message) raised inside a task body
    pub fn user<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Error::User(Arc::from(err.into()))
    }

    /// True if this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True if this is a `wait_until` timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Spawn(Arc::new(err))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
