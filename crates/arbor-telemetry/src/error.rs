//! Telemetry error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while installing the logging stack.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level or a directive is not a valid `EnvFilter` expression.
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// The log directory could not be created.
    #[error("cannot create log directory {}: {source}", .path.display())]
    LogDir {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber is already installed.
    #[error("cannot install subscriber: {0}")]
    Install(String),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
