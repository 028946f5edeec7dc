//! Dependency nodes: one per executed plugin file.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::context::ContextSlot;

/// Stable identity of a node in the tree.
///
/// Keys come from a monotonic counter and are never reused, so a node rebuilt
/// by a reload always gets a fresh key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(u64);

impl NodeKey {
    /// Key of the root runtime node.
    pub const ROOT: Self = Self(0);

    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric form used in published events.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum NodeState {
    /// Executed (or executing) and waiting for its contexts and mount hooks.
    Loading,
    /// Fully mounted.
    Mounted,
    /// Teardown in progress.
    Disposing,
    /// Torn down and removed from the tree.
    Disposed,
    /// Execution, context readiness, or a mount hook failed.
    Failed(String),
}

impl NodeState {
    /// Whether the node can still take part in resolution and mounting.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Loading | Self::Mounted)
    }

    /// Whether the node is being or has been torn down.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disposing | Self::Disposed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => f.write_str("loading"),
            Self::Mounted => f.write_str("mounted"),
            Self::Disposing => f.write_str("disposing"),
            Self::Disposed => f.write_str("disposed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Teardown callback registered with `on_dispose`.
pub type Disposer = Box<dyn FnOnce() + Send>;

/// Async callback registered with `on_mounted`.
pub type MountHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Local event handler registered with `on` / `once`.
pub type EventHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Item contributed to a named feature registry.
pub type FeatureItem = Arc<dyn Any + Send + Sync>;

/// A local event subscription.
pub(crate) struct Subscription {
    pub(crate) handler: EventHandler,
    pub(crate) once: bool,
}

/// The runtime unit produced by executing one plugin file.
pub struct DependencyNode {
    pub(crate) key: NodeKey,
    pub(crate) id: PathBuf,
    pub(crate) name: String,
    pub(crate) state: NodeState,
    pub(crate) parent: Option<NodeKey>,
    pub(crate) children: Vec<NodeKey>,
    pub(crate) required: BTreeSet<String>,
    pub(crate) provided: BTreeMap<String, ContextSlot>,
    pub(crate) disposers: Vec<Disposer>,
    pub(crate) mount_hooks: Vec<MountHook>,
    pub(crate) subscriptions: HashMap<String, Vec<Subscription>>,
    pub(crate) features: BTreeMap<String, Vec<FeatureItem>>,
}

impl DependencyNode {
    pub(crate) fn new(key: NodeKey, id: PathBuf, name: String, parent: Option<NodeKey>) -> Self {
        Self {
            key,
            id,
            name,
            state: NodeState::Loading,
            parent,
            children: Vec::new(),
            required: BTreeSet::new(),
            provided: BTreeMap::new(),
            disposers: Vec::new(),
            mount_hooks: Vec::new(),
            subscriptions: HashMap::new(),
            features: BTreeMap::new(),
        }
    }

    /// Node key.
    #[must_use]
    pub fn key(&self) -> NodeKey {
        self.key
    }

    /// Source file this node was built from.
    #[must_use]
    pub fn id(&self) -> &Path {
        &self.id
    }

    /// Plugin name derived from the file.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Parent key (`None` only for the root).
    #[must_use]
    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    /// Children in creation order.
    #[must_use]
    pub fn children(&self) -> &[NodeKey] {
        &self.children
    }

    pub(crate) fn push_subscription(&mut self, event: &str, handler: EventHandler, once: bool) {
        self.subscriptions
            .entry(event.to_owned())
            .or_default()
            .push(Subscription { handler, once });
    }

    /// Snapshot handlers for `event`, dropping `once` subscriptions.
    pub(crate) fn take_handlers(&mut self, event: &str) -> Vec<EventHandler> {
        let Some(subs) = self.subscriptions.get_mut(event) else {
            return Vec::new();
        };
        let handlers = subs.iter().map(|s| Arc::clone(&s.handler)).collect();
        subs.retain(|s| !s.once);
        if subs.is_empty() {
            self.subscriptions.remove(event);
        }
        handlers
    }

    pub(crate) fn info(&self) -> NodeInfo {
        NodeInfo {
            key: self.key,
            path: self.id.clone(),
            name: self.name.clone(),
            state: self.state.clone(),
            parent: self.parent,
            children: self.children.clone(),
            provided: self.provided.keys().cloned().collect(),
            required: self.required.iter().cloned().collect(),
        }
    }
}

impl fmt::Debug for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyNode")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("required", &self.required)
            .field("provided", &self.provided.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node key.
    pub key: NodeKey,
    /// Source file.
    pub path: PathBuf,
    /// Plugin name.
    pub name: String,
    /// Lifecycle state.
    pub state: NodeState,
    /// Parent key.
    pub parent: Option<NodeKey>,
    /// Children in creation order.
    pub children: Vec<NodeKey>,
    /// Context names this node declares.
    pub provided: Vec<String>,
    /// Context names this node requires.
    pub required: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_handlers_are_dropped_after_snapshot() {
        let mut node = DependencyNode::new(NodeKey::new(1), "/p/a".into(), "a".into(), None);
        node.push_subscription("ping", Arc::new(|_| {}), false);
        node.push_subscription("ping", Arc::new(|_| {}), true);

        assert_eq!(node.take_handlers("ping").len(), 2);
        assert_eq!(node.take_handlers("ping").len(), 1);
        assert!(node.take_handlers("pong").is_empty());
    }

    #[test]
    fn test_state_predicates() {
        assert!(NodeState::Loading.is_live());
        assert!(NodeState::Mounted.is_live());
        assert!(!NodeState::Failed("x".into()).is_live());
        assert!(NodeState::Disposing.is_terminal());
        assert!(!NodeState::Failed("x".into()).is_terminal());
        assert_eq!(NodeState::Failed("boom".into()).to_string(), "failed: boom");
        assert_eq!(NodeKey::new(3).to_string(), "#3");
    }
}
