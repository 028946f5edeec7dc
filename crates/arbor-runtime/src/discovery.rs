//! Entry resolution: map configured plugin names to files.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::debug;

use crate::loader::ModuleLoader;

/// Outcome of resolving a list of entry names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryResolution {
    /// Entries found, in configured order.
    pub found: Vec<(String, PathBuf)>,
    /// Entries no search directory contains.
    pub missing: Vec<String>,
    /// Entries skipped because they are disabled.
    pub disabled: Vec<String>,
}

/// Resolve `entries` against `search_dirs`; the first directory that has an
/// entry wins. Duplicate names are resolved once.
pub fn resolve_entries(
    loader: &dyn ModuleLoader,
    search_dirs: &[PathBuf],
    entries: &[String],
    disabled: &BTreeSet<String>,
) -> EntryResolution {
    let mut resolution = EntryResolution::default();
    let mut seen = BTreeSet::new();

    for name in entries {
        if !seen.insert(name.as_str()) {
            continue;
        }
        if disabled.contains(name) {
            resolution.disabled.push(name.clone());
            continue;
        }
        match search_dirs.iter().find_map(|dir| loader.locate(dir, name)) {
            Some(path) => {
                debug!(entry = %name, path = %path.display(), "resolved entry");
                resolution.found.push((name.clone(), path));
            },
            None => resolution.missing.push(name.clone()),
        }
    }
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ModuleTable;

    #[test]
    fn test_resolution_order_and_outcomes() {
        let table = ModuleTable::new();
        table.define("/first/chat.toml", |_| Ok(()));
        table.define("/second/chat.toml", |_| Ok(()));
        table.define("/second/tools/index", |_| Ok(()));
        table.define("/first/legacy", |_| Ok(()));

        let dirs = [PathBuf::from("/first"), PathBuf::from("/second")];
        let entries: Vec<String> = ["chat", "tools", "ghost", "legacy", "chat"]
            .into_iter()
            .map(String::from)
            .collect();
        let disabled: BTreeSet<String> = std::iter::once("legacy".to_owned()).collect();

        let res = resolve_entries(&table, &dirs, &entries, &disabled);
        assert_eq!(
            res.found,
            vec![
                ("chat".to_owned(), PathBuf::from("/first/chat.toml")),
                ("tools".to_owned(), PathBuf::from("/second/tools/index")),
            ]
        );
        assert_eq!(res.missing, vec!["ghost".to_owned()]);
        assert_eq!(res.disabled, vec!["legacy".to_owned()]);
    }
}
