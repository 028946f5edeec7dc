//! Configuration struct definitions.
//!
//! Every section derives `Default` with the same values as the embedded
//! `defaults.toml`, so a partially specified file deserializes cleanly.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin tree settings.
    pub runtime: RuntimeSection,
    /// Hot-reload settings.
    pub reload: ReloadSection,
    /// Logging settings.
    pub logging: LoggingSection,
}

/// Plugin tree settings consumed at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Plugin names mounted under the root at start, in order.
    pub entries: Vec<String>,
    /// Directories searched (in order) when resolving entry names.
    pub plugin_dirs: Vec<PathBuf>,
    /// Plugin names that are never created or mounted.
    pub disabled: Vec<String>,
    /// Upper bound on how long a node may wait for its required contexts.
    pub mount_timeout_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            plugin_dirs: vec![PathBuf::from("plugins")],
            disabled: Vec::new(),
            mount_timeout_ms: 5000,
        }
    }
}

/// Hot-reload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSection {
    /// Whether file changes trigger rebuilds at all.
    pub enabled: bool,
    /// Debounce window per file.
    pub debounce_ms: u64,
    /// Whether the host should start the filesystem watcher.
    pub watch: bool,
}

impl Default for ReloadSection {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 100,
            watch: false,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level filter (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Output format (`pretty`, `compact`, `json`, `full`).
    pub format: String,
    /// Extra `EnvFilter` directives (e.g. `arbor_runtime=debug`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}
