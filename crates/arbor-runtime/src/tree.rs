//! Node arena and the flat path index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::context::{ContextSlot, ContextValue};
use crate::node::{DependencyNode, NodeKey, NodeState};
use crate::resolver::plugin_dir;

/// Owns every live node. Parent and child links are keys into the arena.
#[derive(Debug)]
pub(crate) struct Tree {
    nodes: HashMap<NodeKey, DependencyNode>,
    index: HashMap<PathBuf, NodeKey>,
    next_key: u64,
}

impl Tree {
    pub(crate) fn new(root_dir: &Path) -> Self {
        let mut root = DependencyNode::new(NodeKey::ROOT, root_dir.to_path_buf(), "root".into(), None);
        root.state = NodeState::Mounted;
        let mut nodes = HashMap::new();
        nodes.insert(NodeKey::ROOT, root);
        Self {
            nodes,
            index: HashMap::new(),
            next_key: 1,
        }
    }

    pub(crate) fn get(&self, key: NodeKey) -> Option<&DependencyNode> {
        self.nodes.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: NodeKey) -> Option<&mut DependencyNode> {
        self.nodes.get_mut(&key)
    }

    pub(crate) fn lookup(&self, path: &Path) -> Option<NodeKey> {
        self.index.get(path).copied()
    }

    /// State of `key`, reporting removed nodes as disposed.
    pub(crate) fn state_of(&self, key: NodeKey) -> Option<NodeState> {
        match self.nodes.get(&key) {
            Some(node) => Some(node.state.clone()),
            None if key.as_u64() < self.next_key => Some(NodeState::Disposed),
            None => None,
        }
    }

    pub(crate) fn is_loading(&self, key: NodeKey) -> bool {
        self.nodes
            .get(&key)
            .is_some_and(|n| n.state == NodeState::Loading)
    }

    pub(crate) fn is_live(&self, key: NodeKey) -> bool {
        self.nodes.get(&key).is_some_and(|n| n.state.is_live())
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn loading_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state == NodeState::Loading)
            .count()
    }

    /// Create a loading node under `parent` and index it by `path`.
    pub(crate) fn insert_child(&mut self, parent: NodeKey, path: &Path, name: String) -> Option<NodeKey> {
        let key = NodeKey::new(self.next_key);
        let parent_node = self.nodes.get_mut(&parent)?;
        parent_node.children.push(key);
        self.next_key = self.next_key.saturating_add(1);
        self.nodes.insert(
            key,
            DependencyNode::new(key, path.to_path_buf(), name, Some(parent)),
        );
        self.index.insert(path.to_path_buf(), key);
        Some(key)
    }

    /// Unlink a node from its parent and the index and remove it.
    ///
    /// Children must have been removed first.
    pub(crate) fn remove(&mut self, key: NodeKey) -> Option<DependencyNode> {
        let mut node = self.nodes.remove(&key)?;
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != key);
        }
        if self.index.get(&node.id) == Some(&key) {
            self.index.remove(&node.id);
        }
        debug_assert!(node.children.is_empty(), "removed node still has children");
        node.state = NodeState::Disposed;
        Some(node)
    }

    /// Nearest slot named `name` on `from` or one of its ancestors.
    pub(crate) fn resolve(&self, from: NodeKey, name: &str) -> Option<(NodeKey, &ContextSlot)> {
        let mut current = Some(from);
        while let Some(key) = current {
            let node = self.nodes.get(&key)?;
            if let Some(slot) = node.provided.get(name) {
                return Some((key, slot));
            }
            current = node.parent;
        }
        None
    }

    pub(crate) fn resolve_mut(&mut self, from: NodeKey, name: &str) -> Option<&mut ContextSlot> {
        let (provider, _) = self.resolve(from, name)?;
        self.nodes.get_mut(&provider)?.provided.get_mut(name)
    }

    /// Resolve `name` for `consumer`, recording the consumer on the slot.
    pub(crate) fn consume(&mut self, consumer: NodeKey, name: &str) -> Option<ContextValue> {
        if self.nodes.get(&consumer)?.state.is_terminal() {
            return None;
        }
        let slot = self.resolve_mut(consumer, name)?;
        let value = slot.value.clone()?;
        slot.consumers.insert(consumer);
        Some(value)
    }

    /// Required names of `key` that do not resolve to a mounted value.
    ///
    /// With `foreign_only`, names the node provides itself are skipped; they
    /// mount as part of the node's own mount step.
    pub(crate) fn unresolved(&self, key: NodeKey, foreign_only: bool) -> Vec<String> {
        let Some(node) = self.nodes.get(&key) else {
            return Vec::new();
        };
        node.required
            .iter()
            .filter(|name| match self.resolve(key, name) {
                Some((provider, _)) if foreign_only && provider == key => false,
                Some((_, slot)) => slot.value.is_none(),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Register or clear `key` as a waiter on its resolvable but unmounted slots.
    pub(crate) fn set_waiting(&mut self, key: NodeKey, waiting: bool) {
        let names: Vec<String> = match self.nodes.get(&key) {
            Some(node) => node.required.iter().cloned().collect(),
            None => return,
        };
        for name in names {
            if let Some(slot) = self.resolve_mut(key, &name) {
                if waiting && slot.value.is_none() {
                    slot.waiters.insert(key);
                } else {
                    slot.waiters.remove(&key);
                }
            }
        }
    }

    /// Record `key` as a consumer of every required slot that resolves.
    pub(crate) fn record_consumers(&mut self, key: NodeKey) {
        let names: Vec<String> = match self.nodes.get(&key) {
            Some(node) => node.required.iter().cloned().collect(),
            None => return,
        };
        for name in names {
            if let Some(slot) = self.resolve_mut(key, &name) {
                slot.consumers.insert(key);
            }
        }
    }

    /// Depth-first pre-order keys starting at `from`.
    pub(crate) fn preorder(&self, from: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(key) = stack.pop() {
            let Some(node) = self.nodes.get(&key) else {
                continue;
            };
            out.push(key);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Live node whose plugin directory is exactly `dir`.
    pub(crate) fn node_with_plugin_dir(&self, dir: &Path) -> Option<NodeKey> {
        self.index
            .iter()
            .filter(|(path, _)| plugin_dir(path) == dir)
            .map(|(_, key)| *key)
            .find(|key| self.is_live(*key))
    }

    /// Deepest live node whose plugin directory contains `path`.
    pub(crate) fn owner_of_asset(&self, path: &Path) -> Option<NodeKey> {
        self.index
            .iter()
            .filter(|(id, key)| id.as_path() != path && self.is_live(**key))
            .filter_map(|(id, key)| {
                let dir = plugin_dir(id);
                path.starts_with(&dir).then(|| (dir.components().count(), *key))
            })
            .max_by_key(|(depth, key)| (*depth, *key))
            .map(|(_, key)| key)
    }

    /// Check the structural invariants of the arena.
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        for (key, node) in &self.nodes {
            if node.key != *key {
                return Err(format!("node {key} stored under the wrong key"));
            }
            match node.parent {
                None if *key != NodeKey::ROOT => {
                    return Err(format!("non-root node {key} has no parent"));
                },
                Some(parent) => {
                    let Some(p) = self.nodes.get(&parent) else {
                        return Err(format!("node {key} has dangling parent {parent}"));
                    };
                    let count = p.children.iter().filter(|c| **c == *key).count();
                    if count != 1 {
                        return Err(format!("node {key} appears {count} times in {parent}"));
                    }
                    if *key != NodeKey::ROOT && self.index.get(&node.id) != Some(key) {
                        return Err(format!("node {key} is not indexed by {}", node.id.display()));
                    }
                },
                None => {},
            }
            for child in &node.children {
                if self.nodes.get(child).and_then(|c| c.parent) != Some(*key) {
                    return Err(format!("child {child} of {key} does not point back"));
                }
            }
        }
        for (path, key) in &self.index {
            if !self.nodes.contains_key(key) {
                return Err(format!("index entry {} points at removed {key}", path.display()));
            }
        }
        if self.preorder(NodeKey::ROOT).len() != self.nodes.len() {
            return Err("unreachable nodes in arena".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::context_value;

    fn tree() -> (Tree, NodeKey, NodeKey) {
        let mut tree = Tree::new(Path::new("/p"));
        let a = tree.insert_child(NodeKey::ROOT, Path::new("/p/a"), "a".into()).unwrap();
        let b = tree.insert_child(a, Path::new("/p/a/b"), "b".into()).unwrap();
        (tree, a, b)
    }

    #[test]
    fn test_insert_links_both_directions() {
        let (tree, a, b) = tree();
        assert_eq!(tree.get(b).unwrap().parent, Some(a));
        assert_eq!(tree.get(a).unwrap().children, vec![b]);
        assert_eq!(tree.lookup(Path::new("/p/a/b")), Some(b));
        assert!(tree.check_consistency().is_ok());
    }

    #[test]
    fn test_keys_are_never_reused() {
        let (mut tree, _, b) = tree();
        tree.remove(b).unwrap();
        let again = tree.insert_child(NodeKey::ROOT, Path::new("/p/a/b"), "b".into()).unwrap();
        assert_ne!(again, b);
        assert_eq!(tree.state_of(b), Some(NodeState::Disposed));
        assert_eq!(tree.state_of(NodeKey::new(999)), None);
    }

    #[test]
    fn test_remove_unlinks_parent_and_index() {
        let (mut tree, a, b) = tree();
        tree.remove(b).unwrap();
        assert!(tree.get(a).unwrap().children.is_empty());
        assert_eq!(tree.lookup(Path::new("/p/a/b")), None);
        assert!(tree.check_consistency().is_ok());
    }

    #[test]
    fn test_resolution_walks_ancestors_and_shadows() {
        let (mut tree, a, b) = tree();
        tree.get_mut(NodeKey::ROOT).unwrap().provided.insert(
            "db".into(),
            ContextSlot::new("db".into(), context_value(1_u8)),
        );
        assert_eq!(tree.resolve(b, "db").map(|(k, _)| k), Some(NodeKey::ROOT));

        tree.get_mut(a)
            .unwrap()
            .provided
            .insert("db".into(), ContextSlot::new("db".into(), context_value(2_u8)));
        assert_eq!(tree.resolve(b, "db").map(|(k, _)| k), Some(a));
        assert_eq!(tree.resolve(NodeKey::ROOT, "db").map(|(k, _)| k), Some(NodeKey::ROOT));
        assert!(tree.resolve(b, "cache").is_none());
    }

    #[test]
    fn test_unresolved_skips_own_names_when_foreign_only() {
        let (mut tree, a, _) = tree();
        let node = tree.get_mut(a).unwrap();
        node.required.insert("db".into());
        node.required.insert("cfg".into());
        node.provided
            .insert("db".into(), ContextSlot::new("db".into(), context_value(())));

        assert_eq!(tree.unresolved(a, true), vec!["cfg".to_owned()]);
        assert_eq!(tree.unresolved(a, false), vec!["cfg".to_owned(), "db".to_owned()]);

        tree.get_mut(a).unwrap().provided.get_mut("db").unwrap().value = Some(Arc::new(()));
        assert_eq!(tree.unresolved(a, false), vec!["cfg".to_owned()]);
    }

    #[test]
    fn test_consume_records_consumer_only_when_mounted() {
        let (mut tree, a, b) = tree();
        tree.get_mut(a)
            .unwrap()
            .provided
            .insert("db".into(), ContextSlot::new("db".into(), context_value(())));
        assert!(tree.consume(b, "db").is_none());
        assert!(tree.get(a).unwrap().provided["db"].consumers.is_empty());

        tree.get_mut(a).unwrap().provided.get_mut("db").unwrap().value = Some(Arc::new(()));
        assert!(tree.consume(b, "db").is_some());
        assert!(tree.get(a).unwrap().provided["db"].consumers.contains(&b));
    }

    #[test]
    fn test_preorder_and_asset_owner() {
        let (mut tree, a, b) = tree();
        let c = tree.insert_child(NodeKey::ROOT, Path::new("/p/c"), "c".into()).unwrap();
        assert_eq!(tree.preorder(NodeKey::ROOT), vec![NodeKey::ROOT, a, b, c]);

        assert_eq!(tree.owner_of_asset(Path::new("/p/a/b/style.css")), Some(b));
        assert_eq!(tree.owner_of_asset(Path::new("/p/a/readme.md")), Some(a));
        assert_eq!(tree.owner_of_asset(Path::new("/q/x")), None);
        assert_eq!(tree.node_with_plugin_dir(Path::new("/p/a")), Some(a));
    }
}
