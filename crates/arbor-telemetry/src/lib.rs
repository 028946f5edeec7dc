//! Arbor Telemetry - logging setup for hosts of the arbor plugin runtime.
//!
//! The runtime crates only emit `tracing` events; installing a subscriber is
//! the host's job. This crate turns a [`LogConfig`] (or the `[logging]`
//! section of `arbor-config`) into an installed `tracing-subscriber` stack.
//!
//! # Example
//!
//! ```rust,no_run
//! use arbor_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), arbor_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("arbor_runtime=trace");
//!
//! let _guard = setup_logging(&config)?;
//! tracing::info!("plugin runtime starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileRotation, LogConfig, LogFormat, LogGuard, LogTarget, setup_default_logging, setup_logging,
};
