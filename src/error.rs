//! Error types for the bench.
//!
//! Two layers of errors exist, matching the two sides of the device channel:
//!
//! - **`ChannelError`**: the value every hardware call returns on failure. It
//!   never escapes the channel as a panic; callers inspect it and apply their
//!   own retry policy (see [`crate::retry`]).
//! - **`BenchError`**: crate-level failures outside the hardware path, such as
//!   unreadable or out-of-range settings, report I/O and CSV serialization.
//!
//! Run-level outcomes (completed / stopped / error) are not errors at all; they
//! are modelled by [`crate::cycle::RunOutcome`].

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Errors raised outside a single hardware transaction.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Settings could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings were read but are out of range.
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV encoding or decoding failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A hardware transaction failed.
    #[error("Hardware channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A report file could not be written.
    #[error("Report error: {0}")]
    Report(String),

    /// Real instruments were requested without the `serial` feature.
    #[error("Serial support not enabled. Rebuild with --features serial or use --simulate")]
    SerialFeatureDisabled,
}

/// Failure of a single hardware transaction.
///
/// Timeouts and transport errors are transient and retried by the caller;
/// validation errors mean the device answered but the answer cannot be trusted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// No reply within the instrument timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// Elapsed time when the wait gave up.
        after: Duration,
    },

    /// The port could not be opened, written or read.
    #[error("Transport error on {port}: {message}")]
    Transport {
        /// Port name.
        port: String,
        /// Underlying I/O error text.
        message: String,
    },

    /// The reply was malformed or out of range.
    #[error("Invalid response: {0}")]
    Validation(String),

    /// The relay worker is gone.
    #[error("Relay queue closed")]
    QueueClosed,
}

impl ChannelError {
    /// True for a response timeout, as opposed to a hard transport or protocol failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout { .. })
    }

    pub(crate) fn transport(port: &str, err: impl std::fmt::Display) -> Self {
        ChannelError::Transport {
            port: port.to_string(),
            message: err.to_string(),
        }
    }
}
