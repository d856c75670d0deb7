//! Error types
//!
//! Typed failures at the orchestration boundaries. Fetchers, updaters and
//! cache compute functions report plain `anyhow::Error`s; these enums wrap
//! them where the caller needs to tell the cases apart.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single fetcher run within a cycle.
///
/// None of these abort a cycle: the manager logs them per key and moves on.
#[derive(Debug, Error)]
pub enum FetchError {
    /// `Registry::run` was called with a key the registry does not hold
    #[error("unknown fetcher key: {0}")]
    UnknownFetcherKey(String),

    /// The fetcher's own error, passed through unchanged
    #[error(transparent)]
    Fetcher(#[from] anyhow::Error),

    /// The per-fetcher time budget elapsed before the run completed
    #[error("fetcher {key} reached a timeout after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    /// The fetcher panicked; caught at the task boundary
    #[error("fetcher {key} recovered from panic: {message}")]
    Fault { key: String, message: String },

    /// The shared cancellation token fired while the fetcher was running
    #[error("fetcher {key} cancelled")]
    Cancelled { key: String },
}

impl FetchError {
    /// Whether this failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }

    /// Whether this failure was a caught panic.
    pub fn is_fault(&self) -> bool {
        matches!(self, FetchError::Fault { .. })
    }
}

/// Lifecycle misuse of the [`Manager`](crate::fetching::Manager).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("manager is already running")]
    AlreadyRunning,

    #[error("manager has been stopped")]
    Stopped,
}

/// Invalid fetching configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("fetcher timeout ({timeout:?}) must not exceed the cycle period ({period:?})")]
    TimeoutExceedsPeriod { timeout: Duration, period: Duration },

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("benchmark '{0}' is not supported")]
    UnsupportedBenchmark(String),
}

/// Failure while assembling a benchmark.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no registry strategy registered for benchmark {0}")]
    MissingStrategy(String),

    #[error("failed to build registry for benchmark {benchmark}: {source}")]
    Registry {
        benchmark: String,
        #[source]
        source: anyhow::Error,
    },
}
