//! Runtime configuration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arbor_config::Config;

use crate::resolver::normalize;

/// Default upper bound on how long a node waits for its contexts.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default debounce window for file changes.
pub const DEFAULT_RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Settings for one [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Directory relative paths are resolved against. Also the root node's id.
    pub base_dir: PathBuf,
    /// Plugin names mounted under the root at start, in order.
    pub entries: Vec<String>,
    /// Absolute directories searched for entries.
    pub plugin_dirs: Vec<PathBuf>,
    /// Plugin names that are never created.
    pub disabled: BTreeSet<String>,
    /// Upper bound on a node's wait for its contexts.
    pub mount_timeout: Duration,
    /// Whether file changes are acted on.
    pub reload_enabled: bool,
    /// Debounce window per file.
    pub reload_debounce: Duration,
    /// Whether the host should run the filesystem watcher.
    pub watch: bool,
}

impl RuntimeConfig {
    /// Defaults rooted at `base_dir`, searching `{base_dir}/plugins`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = normalize(&base_dir.into());
        Self {
            plugin_dirs: vec![base_dir.join("plugins")],
            base_dir,
            entries: Vec::new(),
            disabled: BTreeSet::new(),
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            reload_enabled: true,
            reload_debounce: DEFAULT_RELOAD_DEBOUNCE,
            watch: false,
        }
    }

    /// Build from a loaded [`Config`], resolving relative plugin directories
    /// against `base_dir`.
    #[must_use]
    pub fn from_config(config: &Config, base_dir: impl Into<PathBuf>) -> Self {
        let mut out = Self::new(base_dir);
        out.entries.clone_from(&config.runtime.entries);
        out.plugin_dirs = config
            .runtime
            .plugin_dirs
            .iter()
            .map(|dir| out.absolute(dir))
            .collect();
        out.disabled = config.runtime.disabled.iter().cloned().collect();
        out.mount_timeout = Duration::from_millis(config.runtime.mount_timeout_ms);
        out.reload_enabled = config.reload.enabled;
        out.reload_debounce = Duration::from_millis(config.reload.debounce_ms);
        out.watch = config.reload.watch;
        out
    }

    /// Set the entry names.
    #[must_use]
    pub fn with_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries = entries.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the plugin search directories.
    #[must_use]
    pub fn with_plugin_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.plugin_dirs = dirs.into_iter().map(|d| self.absolute(d.as_ref())).collect();
        self
    }

    /// Disable a plugin by name.
    #[must_use]
    pub fn with_disabled(mut self, name: impl Into<String>) -> Self {
        self.disabled.insert(name.into());
        self
    }

    /// Set the mount timeout.
    #[must_use]
    pub fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    /// Set the reload debounce window.
    #[must_use]
    pub fn with_reload_debounce(mut self, debounce: Duration) -> Self {
        self.reload_debounce = debounce;
        self
    }

    /// Enable or disable reloading.
    #[must_use]
    pub fn with_reload(mut self, enabled: bool) -> Self {
        self.reload_enabled = enabled;
        self
    }

    /// Whether `name` is disabled.
    #[must_use]
    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.contains(name)
    }

    /// Resolve `path` against the base directory.
    #[must_use]
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.base_dir.join(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new("/srv/app");
        assert_eq!(config.plugin_dirs, vec![PathBuf::from("/srv/app/plugins")]);
        assert_eq!(config.mount_timeout, DEFAULT_MOUNT_TIMEOUT);
        assert_eq!(config.reload_debounce, Duration::from_millis(100));
        assert!(config.reload_enabled);
    }

    #[test]
    fn test_from_config_resolves_dirs() {
        let mut config = Config::default();
        config.runtime.entries = vec!["chat".into()];
        config.runtime.plugin_dirs = vec!["plugins".into(), "/opt/shared".into(), "./x/../y".into()];
        config.runtime.disabled = vec!["legacy".into()];
        config.runtime.mount_timeout_ms = 250;
        config.reload.debounce_ms = 40;

        let rc = RuntimeConfig::from_config(&config, "/srv/app");
        assert_eq!(rc.entries, vec!["chat".to_owned()]);
        assert_eq!(
            rc.plugin_dirs,
            vec![
                PathBuf::from("/srv/app/plugins"),
                PathBuf::from("/opt/shared"),
                PathBuf::from("/srv/app/y"),
            ]
        );
        assert!(rc.is_disabled("legacy"));
        assert!(!rc.is_disabled("chat"));
        assert_eq!(rc.mount_timeout, Duration::from_millis(250));
        assert_eq!(rc.reload_debounce, Duration::from_millis(40));
    }

    #[test]
    fn test_builder() {
        let rc = RuntimeConfig::new("/a")
            .with_entries(["x", "y"])
            .with_plugin_dirs(["mods"])
            .with_disabled("y")
            .with_reload(false)
            .with_mount_timeout(Duration::from_millis(10));
        assert_eq!(rc.entries.len(), 2);
        assert_eq!(rc.plugin_dirs, vec![PathBuf::from("/a/mods")]);
        assert!(rc.is_disabled("y"));
        assert!(!rc.reload_enabled);
        assert_eq!(rc.absolute(Path::new("b/../c")), PathBuf::from("/a/c"));
    }
}
