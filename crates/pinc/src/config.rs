//! Runtime configuration
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set through the `with_*` setters
//! 2. **Environment variables**: `PINC_*` variables applied by [`RuntimeConfig::from_env`]
//! 3. **Defaults**: [`RuntimeConfig::default()`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `PINC_POOL_SIZE` | `usize` | `pool_size` |
//! | `PINC_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `PINC_DRAIN_ON_EXIT` | `bool` | `drain_on_exit` |

use crate::error::{Error, Result};

/// Environment variable name for the worker count.
pub const ENV_POOL_SIZE: &str = "PINC_POOL_SIZE";
/// Environment variable name for the thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "PINC_THREAD_NAME_PREFIX";
/// Environment variable name for the drain-on-exit toggle.
pub const ENV_DRAIN_ON_EXIT: &str = "PINC_DRAIN_ON_EXIT";

/// Configuration for a [`Runtime`](crate::Runtime) or [`Scheduler`](crate::Scheduler)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of pool workers (0 = available hardware parallelism)
    pub pool_size: usize,

    /// Prefix for worker and timer thread names
    pub thread_name_prefix: String,

    /// When the root task finishes, wait for detached tasks to finish
    /// instead of abandoning them
    pub drain_on_exit: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 0,
            thread_name_prefix: "pinc".to_string(),
            drain_on_exit: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `PINC_*` overrides that are present in the environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = read_env(ENV_POOL_SIZE) {
            self.pool_size = parse_usize(ENV_POOL_SIZE, &val)?;
        }
        if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        if let Some(val) = read_env(ENV_DRAIN_ON_EXIT) {
            self.drain_on_exit = parse_bool(ENV_DRAIN_ON_EXIT, &val)?;
        }
        Ok(())
    }

    /// Set the worker count
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the drain-on-exit policy
    pub fn with_drain_on_exit(mut self, drain: bool) -> Self {
        self.drain_on_exit = drain;
        self
    }

    /// Worker count with the `0 = num_cpus` rule applied
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            num_cpus::get()
        } else {
            self.pool_size
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn parse_usize(name: &str, val: &str) -> Result<usize> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| Error::Config(format!("{}: expected an unsigned integer, got {:?}", name, val)))
}

pub(crate) fn parse_bool(name: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{}: expected a boolean, got {:?}", name, val))),
    }
}
