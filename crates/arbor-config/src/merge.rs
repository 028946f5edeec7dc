//! Layer merging over raw TOML trees.
//!
//! Layers are merged as [`toml::Value`] trees before deserialization, so a
//! key a layer leaves out never clobbers what a lower layer set. Every leaf
//! remembers the layer that last wrote it.

use std::collections::HashMap;
use std::fmt;

/// Where a configuration value came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigLayer {
    /// The embedded `defaults.toml`.
    Defaults,
    /// `~/.arbor/config.toml`.
    User,
    /// `{workspace}/.arbor/config.toml`.
    Workspace,
    /// An `ARBOR_*` variable filling a field no file set.
    Environment,
}

impl ConfigLayer {
    /// Short human label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Defaults => "defaults",
            Self::User => "user config",
            Self::Workspace => "workspace config",
            Self::Environment => "environment",
        }
    }
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Dotted field path (`reload.debounce_ms`) to the layer that set it.
pub type FieldSources = HashMap<String, ConfigLayer>;

/// A TOML tree built up one layer at a time.
#[derive(Debug, Clone)]
pub struct Layered {
    tree: toml::Value,
    sources: FieldSources,
}

impl Layered {
    /// Start from `base`, attributing all of its leaves to `layer`.
    #[must_use]
    pub fn new(base: toml::Value, layer: ConfigLayer) -> Self {
        let mut sources = FieldSources::new();
        mark_leaves(&base, &mut Vec::new(), layer, &mut sources);
        Self { tree: base, sources }
    }

    /// Merge `overlay` on top.
    ///
    /// Tables merge key by key; anything else in the overlay replaces the
    /// value underneath, arrays included.
    pub fn apply(&mut self, overlay: toml::Value, layer: ConfigLayer) {
        merge_into(
            &mut self.tree,
            overlay,
            &mut Vec::new(),
            layer,
            &mut self.sources,
        );
    }

    /// Set a single dotted field, creating missing tables on the way.
    pub fn set(&mut self, field: &str, value: toml::Value, layer: ConfigLayer) {
        let mut segments = field.split('.');
        let Some(leaf) = segments.next_back() else {
            return;
        };

        let Some(mut table) = self.tree.as_table_mut() else {
            return;
        };
        for segment in segments {
            let next = table
                .entry(segment)
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
            let Some(inner) = next.as_table_mut() else {
                return;
            };
            table = inner;
        }
        table.insert(leaf.to_owned(), value);
        self.sources.insert(field.to_owned(), layer);
    }

    /// Layer that set `field`, if any did.
    #[must_use]
    pub fn source(&self, field: &str) -> Option<ConfigLayer> {
        self.sources.get(field).copied()
    }

    /// The merged tree and where each leaf came from.
    #[must_use]
    pub fn into_parts(self) -> (toml::Value, FieldSources) {
        (self.tree, self.sources)
    }
}

fn merge_into(
    base: &mut toml::Value,
    overlay: toml::Value,
    path: &mut Vec<String>,
    layer: ConfigLayer,
    sources: &mut FieldSources,
) {
    match (base, overlay) {
        (toml::Value::Table(into), toml::Value::Table(from)) => {
            for (key, value) in from {
                path.push(key.clone());
                match into.get_mut(&key) {
                    Some(slot) if value.is_table() && slot.is_table() => {
                        merge_into(slot, value, path, layer, sources);
                    },
                    _ => {
                        forget_below(path, sources);
                        mark_leaves(&value, path, layer, sources);
                        into.insert(key, value);
                    },
                }
                path.pop();
            }
        },
        (slot, value) => {
            forget_below(path, sources);
            mark_leaves(&value, path, layer, sources);
            *slot = value;
        },
    }
}

/// Drop attributions for leaves under `path` that are about to be replaced.
fn forget_below(path: &[String], sources: &mut FieldSources) {
    if path.is_empty() {
        sources.clear();
        return;
    }
    let dotted = path.join(".");
    let nested = format!("{dotted}.");
    sources.retain(|field, _| *field != dotted && !field.starts_with(&nested));
}

fn mark_leaves(
    value: &toml::Value,
    path: &mut Vec<String>,
    layer: ConfigLayer,
    sources: &mut FieldSources,
) {
    match value {
        toml::Value::Table(table) => {
            for (key, child) in table {
                path.push(key.clone());
                mark_leaves(child, path, layer, sources);
                path.pop();
            }
        },
        _ if !path.is_empty() => {
            sources.insert(path.join("."), layer);
        },
        _ => {},
    }
}
