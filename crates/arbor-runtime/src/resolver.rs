//! Path rules and call-site ownership.
//!
//! A plugin file `plugins/chat.toml` owns the directory `plugins/chat/`; an
//! `index` or `mod` file owns the directory it sits in. Files found inside a
//! plugin directory become children of that plugin's node.

use std::path::{Component, Path, PathBuf};

use crate::loader::ModuleLoader;
use crate::node::NodeKey;
use crate::tree::Tree;

const DIRECTORY_STEMS: &[&str] = &["index", "mod"];

fn is_directory_module(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|stem| DIRECTORY_STEMS.contains(&stem))
}

/// Directory whose files become children of the plugin at `path`.
#[must_use]
pub fn plugin_dir(path: &Path) -> PathBuf {
    if is_directory_module(path) {
        path.parent().map_or_else(PathBuf::new, Path::to_path_buf)
    } else {
        path.with_extension("")
    }
}

/// Plugin name for the file at `path`.
///
/// This is the name matched against entry and disabled lists.
#[must_use]
pub fn node_name(path: &Path) -> String {
    let named = if is_directory_module(path) {
        path.parent().and_then(Path::file_name)
    } else {
        path.file_stem()
    };
    named
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Resolve `request` against the directory of `caller_file`.
///
/// Absolute requests are returned normalized; `.` and `..` are folded
/// lexically without touching the filesystem.
#[must_use]
pub fn resolve_request(caller_file: &Path, request: &Path) -> PathBuf {
    if request.is_absolute() {
        return normalize(request);
    }
    let base = caller_file.parent().unwrap_or(caller_file);
    normalize(&base.join(request))
}

/// Lexically normalize a path.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            },
            other => out.push(other),
        }
    }
    out
}

/// Where a newly requested file should be attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Owner {
    /// Attach under this node.
    Node(NodeKey),
    /// The owning plugin is not loaded yet; create this file first.
    Create(PathBuf),
}

/// Decide the parent for `target`.
///
/// Ancestor directories of `target` are walked nearest first. A directory
/// owned by a live node wins; a directory owned by a module the loader knows
/// but that is not loaded yet is created first. Reaching a plugin search
/// directory makes the file a top-level plugin under the root. A file outside
/// every search directory is adopted by the calling node, or by the root when
/// there is no caller.
pub(crate) fn resolve_owner(
    tree: &Tree,
    loader: &dyn ModuleLoader,
    search_dirs: &[PathBuf],
    caller: Option<NodeKey>,
    target: &Path,
) -> Owner {
    for dir in target.ancestors().skip(1) {
        if dir.as_os_str().is_empty() {
            break;
        }
        if let Some(key) = tree.node_with_plugin_dir(dir) {
            return Owner::Node(key);
        }
        if search_dirs.iter().any(|s| s.as_path() == dir) {
            return Owner::Node(NodeKey::ROOT);
        }
        if let Some(module) = loader.owner_module(dir) {
            if module != target && tree.lookup(&module).is_none() {
                return Owner::Create(module);
            }
        }
    }

    match caller {
        Some(key) if tree.is_live(key) => Owner::Node(key),
        _ => Owner::Node(NodeKey::ROOT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ModuleTable;

    #[test]
    fn test_plugin_dir_rules() {
        assert_eq!(plugin_dir(Path::new("/p/chat.toml")), PathBuf::from("/p/chat"));
        assert_eq!(plugin_dir(Path::new("/p/chat")), PathBuf::from("/p/chat"));
        assert_eq!(plugin_dir(Path::new("/p/chat/index.rs")), PathBuf::from("/p/chat"));
        assert_eq!(plugin_dir(Path::new("/p/chat/mod")), PathBuf::from("/p/chat"));
    }

    #[test]
    fn test_node_name_rules() {
        assert_eq!(node_name(Path::new("/p/chat.toml")), "chat");
        assert_eq!(node_name(Path::new("/p/chat/index.js")), "chat");
        assert_eq!(node_name(Path::new("/p/chat/mod.rs")), "chat");
        assert_eq!(node_name(Path::new("/p/chat/commands")), "commands");
    }

    #[test]
    fn test_resolve_request_relative_to_caller_dir() {
        let caller = Path::new("/p/a/index");
        assert_eq!(resolve_request(caller, Path::new("./b")), PathBuf::from("/p/a/b"));
        assert_eq!(resolve_request(caller, Path::new("../c")), PathBuf::from("/p/c"));
        assert_eq!(resolve_request(caller, Path::new("/abs/x")), PathBuf::from("/abs/x"));
        assert_eq!(
            resolve_request(Path::new("/p/a"), Path::new("a/b")),
            PathBuf::from("/p/a/b")
        );
    }

    #[test]
    fn test_owner_prefers_containing_node() {
        let mut tree = Tree::new(Path::new("/p"));
        let a = tree.insert_child(NodeKey::ROOT, Path::new("/p/a"), "a".into()).unwrap();
        let c = tree.insert_child(NodeKey::ROOT, Path::new("/p/c"), "c".into()).unwrap();
        let table = ModuleTable::new();
        let dirs = [PathBuf::from("/p")];

        let owner = resolve_owner(&tree, &table, &dirs, Some(c), Path::new("/p/a/b"));
        assert_eq!(owner, Owner::Node(a));
    }

    #[test]
    fn test_owner_falls_back_to_caller_then_root() {
        let mut tree = Tree::new(Path::new("/p"));
        let c = tree.insert_child(NodeKey::ROOT, Path::new("/p/c"), "c".into()).unwrap();
        let table = ModuleTable::new();
        let dirs = [PathBuf::from("/p")];

        let target = Path::new("/elsewhere/x");
        assert_eq!(resolve_owner(&tree, &table, &dirs, Some(c), target), Owner::Node(c));
        assert_eq!(resolve_owner(&tree, &table, &dirs, None, target), Owner::Node(NodeKey::ROOT));
    }

    #[test]
    fn test_owner_requests_unloaded_parent_module() {
        let tree = Tree::new(Path::new("/p"));
        let table = ModuleTable::new();
        table.define("/p/a", |_| Ok(()));
        let dirs = [PathBuf::from("/p")];

        let owner = resolve_owner(&tree, &table, &dirs, None, Path::new("/p/a/b"));
        assert_eq!(owner, Owner::Create(PathBuf::from("/p/a")));

        // The search directory bounds the walk; top-level plugins go under the
        // root even when another node asked for them.
        let owner = resolve_owner(&tree, &table, &dirs, None, Path::new("/p/d"));
        assert_eq!(owner, Owner::Node(NodeKey::ROOT));
        let mut tree = tree;
        let c = tree.insert_child(NodeKey::ROOT, Path::new("/p/c"), "c".into()).unwrap();
        let owner = resolve_owner(&tree, &table, &dirs, Some(c), Path::new("/p/d"));
        assert_eq!(owner, Owner::Node(NodeKey::ROOT));
    }
}
