//! `ARBOR_*` environment fallbacks and `${VAR}` expansion.
//!
//! Environment variables only fill fields that no config file set; a value
//! from the defaults layer still counts as unset.

use std::collections::HashMap;
use std::hash::BuildHasher;

use tracing::debug;

use crate::merge::{ConfigLayer, Layered};

/// How the raw variable text becomes a TOML value.
#[derive(Debug, Clone, Copy)]
enum Kind {
    Text,
    Integer,
    Flag,
    /// Comma separated, blanks dropped.
    List,
}

impl Kind {
    fn parse(self, raw: &str) -> Option<toml::Value> {
        let raw = raw.trim();
        match self {
            Self::Text => Some(toml::Value::String(raw.to_owned())),
            Self::Integer => raw.parse().ok().map(toml::Value::Integer),
            Self::Flag => parse_flag(raw).map(toml::Value::Boolean),
            Self::List => Some(toml::Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| toml::Value::String(item.to_owned()))
                    .collect(),
            )),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    const TRUE: [&str; 4] = ["1", "true", "yes", "on"];
    const FALSE: [&str; 4] = ["0", "false", "no", "off"];
    if TRUE.iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if FALSE.iter().any(|f| raw.eq_ignore_ascii_case(f)) {
        Some(false)
    } else {
        None
    }
}

/// Variable, field it backs, value kind.
const FALLBACKS: &[(&str, &str, Kind)] = &[
    ("ARBOR_ENTRIES", "runtime.entries", Kind::List),
    ("ARBOR_PLUGIN_DIRS", "runtime.plugin_dirs", Kind::List),
    ("ARBOR_DISABLED", "runtime.disabled", Kind::List),
    ("ARBOR_MOUNT_TIMEOUT_MS", "runtime.mount_timeout_ms", Kind::Integer),
    ("ARBOR_RELOAD", "reload.enabled", Kind::Flag),
    ("ARBOR_RELOAD_DEBOUNCE_MS", "reload.debounce_ms", Kind::Integer),
    ("ARBOR_WATCH", "reload.watch", Kind::Flag),
    ("ARBOR_LOG_LEVEL", "logging.level", Kind::Text),
    ("ARBOR_LOG_FORMAT", "logging.format", Kind::Text),
];

/// Snapshot the process environment.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Fill fields still at their default from `ARBOR_*` variables.
///
/// Unparseable values are skipped. Returns how many fields were filled.
pub fn apply_env_fallbacks<S: BuildHasher>(
    layered: &mut Layered,
    env_vars: &HashMap<String, String, S>,
) -> usize {
    let mut applied: usize = 0;
    for &(var, field, kind) in FALLBACKS {
        let Some(raw) = env_vars.get(var) else {
            continue;
        };
        if layered
            .source(field)
            .is_some_and(|layer| layer != ConfigLayer::Defaults)
        {
            debug!(var, field, "config file already sets field, env ignored");
            continue;
        }
        match kind.parse(raw) {
            Some(value) => {
                layered.set(field, value, ConfigLayer::Environment);
                applied = applied.saturating_add(1);
            },
            None => debug!(var, value = %raw, "unparseable env value ignored"),
        }
    }
    applied
}

/// Replace `${VAR}` in every string of `value` with the variable's value.
///
/// Unknown variables and unterminated references stay as written.
pub fn expand_references<S: BuildHasher>(
    value: &mut toml::Value,
    env_vars: &HashMap<String, String, S>,
) {
    match value {
        toml::Value::String(text) if text.contains("${") => {
            *text = expand(text, env_vars);
        },
        toml::Value::Table(table) => {
            for (_, child) in table.iter_mut() {
                expand_references(child, env_vars);
            }
        },
        toml::Value::Array(items) => {
            for child in items {
                expand_references(child, env_vars);
            }
        },
        _ => {},
    }
}

fn expand<S: BuildHasher>(input: &str, env_vars: &HashMap<String, String, S>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some((before, after)) = rest.split_once("${") {
        out.push_str(before);
        match after.split_once('}') {
            Some((name, tail)) if !name.is_empty() => {
                if let Some(found) = env_vars.get(name) {
                    out.push_str(found);
                } else {
                    debug!(var = name, "unresolved reference left in config");
                    out.push_str("${");
                    out.push_str(name);
                    out.push('}');
                }
                rest = tail;
            },
            _ => {
                out.push_str("${");
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn layered(text: &str, layer: ConfigLayer) -> Layered {
        Layered::new(toml::from_str(text).unwrap(), layer)
    }

    #[test]
    fn test_fallbacks_fill_default_and_missing_fields() {
        let mut config = layered("[runtime]\nmount_timeout_ms = 5000\n", ConfigLayer::Defaults);
        let applied = apply_env_fallbacks(
            &mut config,
            &env(&[
                ("ARBOR_MOUNT_TIMEOUT_MS", " 250 "),
                ("ARBOR_ENTRIES", "a, b,,c"),
                ("ARBOR_WATCH", "YES"),
            ]),
        );
        assert_eq!(applied, 3);
        assert_eq!(config.source("reload.watch"), Some(ConfigLayer::Environment));

        let (tree, _) = config.into_parts();
        assert_eq!(tree["runtime"]["mount_timeout_ms"].as_integer(), Some(250));
        let entries: Vec<_> = tree["runtime"]["entries"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert_eq!(entries, ["a", "b", "c"]);
        assert_eq!(tree["reload"]["watch"].as_bool(), Some(true));
    }

    #[test]
    fn test_file_values_beat_the_environment() {
        let mut config = layered("[logging]\nlevel = \"warn\"\n", ConfigLayer::User);
        let applied = apply_env_fallbacks(&mut config, &env(&[("ARBOR_LOG_LEVEL", "trace")]));
        assert_eq!(applied, 0);
        assert_eq!(config.source("logging.level"), Some(ConfigLayer::User));
    }

    #[test]
    fn test_unparseable_values_are_skipped() {
        let mut config = layered("", ConfigLayer::Defaults);
        let applied = apply_env_fallbacks(
            &mut config,
            &env(&[("ARBOR_RELOAD_DEBOUNCE_MS", "soon"), ("ARBOR_RELOAD", "maybe")]),
        );
        assert_eq!(applied, 0);
        assert_eq!(config.source("reload.enabled"), None);
    }

    #[test]
    fn test_references_expand_in_nested_strings() {
        let mut tree: toml::Value = toml::from_str(
            "dirs = [\"${HOME_DIR}/plugins\", \"${MISSING}/x\", \"${broken\", \"${}\"]",
        )
        .unwrap();
        expand_references(&mut tree, &env(&[("HOME_DIR", "/home/me")]));

        let dirs: Vec<_> = tree["dirs"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert_eq!(dirs, ["/home/me/plugins", "${MISSING}/x", "${broken", "${}"]);
    }
}
