//! Configuration errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A layer is not valid TOML or does not match the schema.
    #[error("invalid TOML in {origin}: {source}")]
    Parse {
        /// File path, or a label such as `<embedded defaults>`.
        origin: String,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// A config file is over the size limit.
    #[error("{} is {size} bytes, over the {limit} byte limit", .path.display())]
    TooLarge {
        /// File that was rejected.
        path: PathBuf,
        /// Its size.
        size: u64,
        /// The limit.
        limit: u64,
    },

    /// A value is out of range or inconsistent with another.
    #[error("invalid `{field}`: {message}")]
    Invalid {
        /// Dotted field path, e.g. `reload.debounce_ms`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// No home directory to look for the user layer in.
    #[error("cannot determine the home directory")]
    NoHomeDir,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
