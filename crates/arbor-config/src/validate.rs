//! Checks run on the merged [`Config`](crate::Config): numeric ranges,
//! known level and format names, and fields that contradict each other.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound for the mount timeout (10 minutes).
const MAX_MOUNT_TIMEOUT_MS: u64 = 600_000;

/// Upper bound for the reload debounce window (1 minute).
const MAX_DEBOUNCE_MS: u64 = 60_000;

/// Check `config`, stopping at the first problem.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] naming the offending field.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_runtime(config)?;
    validate_reload(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_runtime(config: &Config) -> ConfigResult<()> {
    let r = &config.runtime;

    if r.mount_timeout_ms == 0 || r.mount_timeout_ms > MAX_MOUNT_TIMEOUT_MS {
        return Err(invalid(
            "runtime.mount_timeout_ms",
            format!("mount_timeout_ms must be between 1 and {MAX_MOUNT_TIMEOUT_MS}"),
        ));
    }

    if let Some(bad) = r.entries.iter().find(|e| e.trim().is_empty()) {
        return Err(invalid(
            "runtime.entries",
            format!("entry names must not be empty, got {bad:?}"),
        ));
    }

    if let Some(both) = r.entries.iter().find(|e| r.disabled.contains(e)) {
        return Err(invalid(
            "runtime.disabled",
            format!("'{both}' is listed both as an entry and as disabled"),
        ));
    }

    Ok(())
}

fn validate_reload(config: &Config) -> ConfigResult<()> {
    let r = &config.reload;
    if r.debounce_ms == 0 || r.debounce_ms > MAX_DEBOUNCE_MS {
        return Err(invalid(
            "reload.debounce_ms",
            format!("debounce_ms must be between 1 and {MAX_DEBOUNCE_MS}"),
        ));
    }
    if r.watch && !r.enabled {
        return Err(invalid(
            "reload.watch",
            "the watcher cannot run while reload is disabled",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !matches!(
        l.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error" | "off"
    ) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported level '{}'; expected one of: trace, debug, info, warn, error, off",
                l.level
            ),
        ));
    }
    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.runtime.mount_timeout_ms = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("runtime.mount_timeout_ms"));
    }

    #[test]
    fn test_entry_also_disabled_rejected() {
        let mut config = Config::default();
        config.runtime.entries = vec!["chat".into()];
        config.runtime.disabled = vec!["chat".into()];
        assert!(matches!(
            validate(&config),
            Err(ConfigError::Invalid { field, .. }) if field == "runtime.disabled"
        ));
    }

    #[test]
    fn test_blank_entry_rejected() {
        let mut config = Config::default();
        config.runtime.entries = vec!["  ".into()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_watch_requires_reload() {
        let mut config = Config::default();
        config.reload.enabled = false;
        config.reload.watch = true;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert!(validate(&config).is_err());
    }
}
