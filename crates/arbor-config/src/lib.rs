#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Arbor Config - layered TOML configuration for the arbor plugin runtime.
//!
//! A [`Config`] has three sections: `[runtime]` (entry plugins, search
//! directories, disabled names, mount timeout), `[reload]` (debounce and
//! watcher switches) and `[logging]`.
//!
//! Later layers win field by field:
//!
//! | layer | source |
//! |-------|--------|
//! | defaults | `defaults.toml`, compiled in |
//! | user | `~/.arbor/config.toml` |
//! | workspace | `{root}/.arbor/config.toml` |
//!
//! `ARBOR_*` variables only fill fields that are still at their default.
//! [`ResolvedConfig::field_sources`] records which layer set what.
//!
//! ```rust,no_run
//! use arbor_config::Config;
//!
//! # fn main() -> arbor_config::ConfigResult<()> {
//! let resolved = Config::load(Some(std::path::Path::new(".")))?;
//! for file in &resolved.loaded_files {
//!     println!("loaded {}", file.display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! This crate knows nothing about the runtime; `arbor-runtime` and
//! `arbor-telemetry` convert its sections into their own types.

/// `ARBOR_*` fallbacks and `${VAR}` expansion.
pub mod env;
/// Error types.
pub mod error;
/// File discovery and the layer stack.
pub mod loader;
/// Merging TOML layers with provenance.
pub mod merge;
/// Section structs.
pub mod types;
/// Range and consistency checks.
pub mod validate;

use std::path::Path;

pub use error::{ConfigError, ConfigResult};
pub use loader::ResolvedConfig;
pub use merge::{ConfigLayer, FieldSources};
pub use types::*;

impl Config {
    /// Load every layer for `workspace_root` (the workspace layer is skipped
    /// when `None`).
    ///
    /// # Errors
    ///
    /// See [`loader::load`].
    pub fn load(workspace_root: Option<&Path>) -> ConfigResult<ResolvedConfig> {
        loader::load(workspace_root, None)
    }

    /// Load a single file, without the user or workspace layers.
    ///
    /// # Errors
    ///
    /// See [`loader::load_file`].
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
