//! The public runtime surface.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use arbor_events::{EventBus, EventMetadata, EventReceiver, RuntimeEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{LoadRequest, Shared};
use crate::config::RuntimeConfig;
use crate::context::{ContextFactory, ContextSlot, ResolvedContext};
use crate::discovery::resolve_entries;
use crate::error::{RuntimeError, RuntimeResult};
use crate::loader::ModuleLoader;
use crate::node::{FeatureItem, NodeInfo, NodeKey, NodeState};
use crate::reload::{ReloadHandler, ReloadManager};
#[cfg(feature = "watch")]
use crate::watcher::{PluginWatcher, WatcherConfig};

/// Outcome of [`Runtime::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReport {
    /// Entries that reached the mounted state.
    pub mounted: Vec<String>,
    /// Entries that failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Entries no plugin directory contains.
    pub missing: Vec<String>,
    /// Entries skipped because they are disabled.
    pub disabled: Vec<String>,
}

impl StartReport {
    /// Whether every entry mounted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }
}

/// Outcome of [`Runtime::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    /// Handlers that ran to completion.
    pub delivered: usize,
    /// Handlers that panicked.
    pub failed: usize,
}

/// What [`Runtime::reload_file`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The node for the file (or for the plugin owning it) was rebuilt.
    Rebuilt {
        /// Key of the disposed node.
        previous: NodeKey,
        /// Key of its replacement.
        node: NodeKey,
    },
    /// A file no node was built from is now loaded.
    Added(NodeKey),
    /// The file no longer exists; its node was disposed.
    Removed(NodeKey),
    /// Nothing in the tree is affected.
    Ignored,
}

/// Hot-reloadable plugin tree.
///
/// Cheap to clone; clones share one tree.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("base_dir", &self.shared.config.base_dir)
            .field("nodes", &self.node_count())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime with a fresh event bus.
    #[must_use]
    pub fn new(config: RuntimeConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        Self::with_event_bus(config, loader, EventBus::new())
    }

    /// Create a runtime publishing to `bus`.
    #[must_use]
    pub fn with_event_bus(
        config: RuntimeConfig,
        loader: Arc<dyn ModuleLoader>,
        bus: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, loader, bus)),
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The event bus the runtime publishes to.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Subscribe to runtime events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.bus.subscribe()
    }

    /// Key of the root node.
    #[must_use]
    pub fn root(&self) -> NodeKey {
        NodeKey::ROOT
    }

    /// Provide a context from the root, visible to every plugin.
    ///
    /// The value is mounted before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DuplicateContext`] if the root already
    /// provides `name`, or [`RuntimeError::ContextMount`] if the factory fails.
    pub async fn provide(
        &self,
        name: impl Into<String>,
        factory: Arc<dyn ContextFactory>,
    ) -> RuntimeResult<()> {
        let name = name.into();
        {
            let mut state = self.shared.lock();
            let root = state
                .tree
                .get_mut(NodeKey::ROOT)
                .ok_or(RuntimeError::NodeNotFound(NodeKey::ROOT))?;
            if root.provided.contains_key(&name) {
                return Err(RuntimeError::DuplicateContext {
                    name,
                    path: root.id.clone(),
                });
            }
            root.provided.insert(
                name.clone(),
                ContextSlot::new(name.clone(), Arc::clone(&factory)),
            );
        }

        let value = match factory.mount().await {
            Ok(value) => value,
            Err(e) => {
                if let Some(root) = self.shared.lock().tree.get_mut(NodeKey::ROOT) {
                    root.provided.remove(&name);
                }
                return Err(RuntimeError::ContextMount {
                    name,
                    message: format!("{e:#}"),
                });
            },
        };
        if let Some(slot) = self
            .shared
            .lock()
            .tree
            .get_mut(NodeKey::ROOT)
            .and_then(|root| root.provided.get_mut(&name))
        {
            slot.value = Some(value);
        }
        self.shared.notify_change();
        debug!(context = %name, "root context provided");
        self.shared.publish(RuntimeEvent::ContextProvided {
            metadata: EventMetadata::new("runtime"),
            provider: NodeKey::ROOT.as_u64(),
            name,
        });
        Ok(())
    }

    /// Mount the configured entries.
    pub async fn start(&self) -> StartReport {
        let entries = self.shared.config.entries.clone();
        self.start_with(&entries).await
    }

    /// Create `entries` under the root, mount them together, and wait for
    /// the tree to settle.
    ///
    /// Entries are executed in order and then mount concurrently. Entries
    /// are siblings under the root, so each one sees only contexts the host
    /// registered with [`provide`](Self::provide) and those of its own
    /// ancestors, never a context declared by another entry.
    ///
    /// Missing, disabled, and failing entries are reported, never fatal.
    pub async fn start_with(&self, entries: &[String]) -> StartReport {
        let config = &self.shared.config;
        let resolution = resolve_entries(
            self.shared.loader.as_ref(),
            &config.plugin_dirs,
            entries,
            &config.disabled,
        );

        let mut report = StartReport {
            missing: resolution.missing,
            disabled: resolution.disabled,
            ..StartReport::default()
        };
        for name in &report.missing {
            warn!(entry = %name, "entry not found in any plugin directory");
            self.shared.publish(RuntimeEvent::EntryNotFound {
                metadata: EventMetadata::new("runtime"),
                name: name.clone(),
            });
        }

        let mut created = Vec::new();
        let mut batch = Vec::new();
        for (name, path) in resolution.found {
            let (result, section) = self.shared.create_section(&LoadRequest {
                path: &path,
                parent: Some(NodeKey::ROOT),
                caller: Some(NodeKey::ROOT),
            });
            batch.extend(section);
            match result {
                Ok(key) => created.push((name, key)),
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }
        self.shared.mount_batch(batch).await;
        self.wait_idle(config.mount_timeout).await;

        for (name, key) in created {
            match self.state(key) {
                Some(NodeState::Mounted) => report.mounted.push(name),
                Some(NodeState::Failed(reason)) => report.failed.push((name, reason)),
                Some(other) => report.failed.push((name, other.to_string())),
                None => report.failed.push((name, "unknown node".to_owned())),
            }
        }

        info!(
            mounted = report.mounted.len(),
            failed = report.failed.len(),
            missing = report.missing.len(),
            "runtime started"
        );
        self.shared.publish(RuntimeEvent::RuntimeStarted {
            metadata: EventMetadata::new("runtime"),
            mounted: report.mounted.len(),
            failed: report.failed.len(),
        });
        report
    }

    /// Create the node for `path` under `parent` and mount it with every
    /// node its execution created.
    ///
    /// If the file already has a node, that node is returned; if that node
    /// is being disposed, the call first waits for the teardown to finish.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Disabled`] for disabled plugins and
    /// [`RuntimeError::NodeNotFound`] if `parent` is not live. Execution and
    /// mount failures do not error; they leave the node failed.
    pub async fn create_child(
        &self,
        parent: NodeKey,
        path: impl AsRef<Path>,
    ) -> RuntimeResult<NodeKey> {
        let path = self.shared.config.absolute(path.as_ref());
        self.wait_not_disposing(&path).await;
        self.create_and_mount(&path, Some(parent), Some(parent)).await
    }

    /// Load `path` with the resolver choosing its parent.
    ///
    /// Relative paths resolve against the base directory.
    ///
    /// # Errors
    ///
    /// Same as [`create_child`](Self::create_child).
    pub async fn use_plugin(&self, path: impl AsRef<Path>) -> RuntimeResult<NodeKey> {
        let path = self.shared.config.absolute(path.as_ref());
        self.wait_not_disposing(&path).await;
        self.create_and_mount(&path, None, None).await
    }

    async fn create_and_mount(
        &self,
        path: &Path,
        parent: Option<NodeKey>,
        caller: Option<NodeKey>,
    ) -> RuntimeResult<NodeKey> {
        let (result, batch) = self.shared.create_section(&LoadRequest {
            path,
            parent,
            caller,
        });
        self.shared.mount_batch(batch).await;
        result
    }

    async fn wait_not_disposing(&self, path: &Path) {
        self.shared
            .wait_until(None, |s| {
                s.tree
                    .lookup(path)
                    .and_then(|k| s.tree.get(k))
                    .is_none_or(|n| n.state != NodeState::Disposing)
            })
            .await;
    }

    /// Dispose a node and its subtree.
    ///
    /// Returns `false` if the node is unknown, is the root, or is already
    /// being disposed.
    pub async fn dispose(&self, key: NodeKey) -> bool {
        self.shared.dispose(key).await
    }

    /// React to a changed, added, or removed file.
    ///
    /// A file with a node is disposed and rebuilt under the same parent (or
    /// only disposed if the loader no longer knows it). A new file the loader
    /// knows is added through the resolver. Any other file inside a plugin's
    /// directory rebuilds that plugin.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement cannot be created, for example
    /// because the plugin is now disabled.
    pub async fn reload_file(&self, path: impl AsRef<Path>) -> RuntimeResult<ReloadOutcome> {
        let path = self.shared.config.absolute(path.as_ref());

        if let Some(previous) = self.node_for(&path) {
            return self.rebuild(previous, &path).await;
        }
        if self.shared.loader.exists(&path) {
            let node = self.use_plugin(&path).await?;
            info!(node = %node, path = %path.display(), "plugin added");
            return Ok(ReloadOutcome::Added(node));
        }
        let owner = {
            let state = self.shared.lock();
            state
                .tree
                .owner_of_asset(&path)
                .and_then(|k| state.tree.get(k).map(|n| (k, n.id.clone())))
        };
        if let Some((owner, owner_path)) = owner {
            debug!(path = %path.display(), owner = %owner, "asset changed");
            return self.rebuild(owner, &owner_path).await;
        }
        debug!(path = %path.display(), "change does not affect the tree");
        Ok(ReloadOutcome::Ignored)
    }

    async fn rebuild(&self, previous: NodeKey, path: &Path) -> RuntimeResult<ReloadOutcome> {
        let parent = self.parent(previous);
        self.shared.dispose_and_wait(previous).await;

        if !self.shared.loader.exists(path) {
            info!(node = %previous, path = %path.display(), "plugin removed");
            return Ok(ReloadOutcome::Removed(previous));
        }
        let parent = parent.filter(|p| self.shared.lock().tree.is_live(*p));
        let node = self.create_and_mount(path, parent, parent).await?;
        info!(previous = %previous, node = %node, path = %path.display(), "plugin rebuilt");
        Ok(ReloadOutcome::Rebuilt { previous, node })
    }

    /// Dispose every entry (last first), stop the reload manager, and release
    /// the root's contexts.
    pub async fn shutdown(&self) {
        let manager = self
            .shared
            .reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(manager) = manager {
            manager.dispose();
        }

        for key in self.children(NodeKey::ROOT).into_iter().rev() {
            self.shared.dispose_and_wait(key).await;
        }
        self.shared.release_contexts(NodeKey::ROOT).await;

        info!("runtime stopped");
        self.shared.publish(RuntimeEvent::RuntimeStopped {
            metadata: EventMetadata::new("runtime"),
        });
    }

    /// Wait until no node is loading. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        #[allow(clippy::arithmetic_side_effects)]
        // Instant + Duration cannot overflow for a bounded timeout
        let deadline = Instant::now() + timeout;
        self.shared
            .wait_until(Some(deadline), |s| s.tree.loading_count() == 0)
            .await
    }

    /// Deliver a local event to every node, depth-first from the root.
    ///
    /// Handlers run outside the runtime lock. A panicking handler is counted
    /// and reported on the event bus; delivery continues.
    pub fn broadcast(&self, event: &str, payload: &serde_json::Value) -> BroadcastReport {
        self.emit_from(NodeKey::ROOT, event, payload)
    }

    /// Deliver a local event to `node` and its subtree.
    pub fn emit_from(
        &self,
        node: NodeKey,
        event: &str,
        payload: &serde_json::Value,
    ) -> BroadcastReport {
        let targets: Vec<_> = {
            let mut state = self.shared.lock();
            let order = state.tree.preorder(node);
            order
                .into_iter()
                .filter_map(|key| {
                    let node = state.tree.get_mut(key)?;
                    if node.state.is_terminal() {
                        return None;
                    }
                    let handlers = node.take_handlers(event);
                    (!handlers.is_empty()).then_some((key, handlers))
                })
                .collect()
        };

        let mut report = BroadcastReport::default();
        for (key, handlers) in targets {
            let (delivered, failed) = self.shared.deliver(key, event, payload, handlers);
            report.delivered = report.delivered.saturating_add(delivered);
            report.failed = report.failed.saturating_add(failed);
        }
        report
    }

    /// Node built from `path`, if any.
    #[must_use]
    pub fn node_for(&self, path: impl AsRef<Path>) -> Option<NodeKey> {
        let path = self.shared.config.absolute(path.as_ref());
        self.shared.lock().tree.lookup(&path)
    }

    /// State of `key`. Removed nodes report [`NodeState::Disposed`].
    #[must_use]
    pub fn state(&self, key: NodeKey) -> Option<NodeState> {
        self.shared.lock().tree.state_of(key)
    }

    /// Parent of `key`.
    #[must_use]
    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.shared.lock().tree.get(key).and_then(|n| n.parent)
    }

    /// Children of `key` in creation order.
    #[must_use]
    pub fn children(&self, key: NodeKey) -> Vec<NodeKey> {
        self.shared
            .lock()
            .tree
            .get(key)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Snapshot of one node.
    #[must_use]
    pub fn info(&self, key: NodeKey) -> Option<NodeInfo> {
        self.shared.lock().tree.get(key).map(|n| n.info())
    }

    /// Snapshot of every node, depth-first from the root.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        let state = self.shared.lock();
        state
            .tree
            .preorder(NodeKey::ROOT)
            .into_iter()
            .filter_map(|k| state.tree.get(k).map(|n| n.info()))
            .collect()
    }

    /// Number of nodes in the tree, root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.shared.lock().tree.len()
    }

    /// Resolve `name` from `from`: the nearest provider on `from` or an
    /// ancestor.
    #[must_use]
    pub fn resolve(&self, from: NodeKey, name: &str) -> Option<ResolvedContext> {
        let state = self.shared.lock();
        state
            .tree
            .resolve(from, name)
            .map(|(provider, slot)| ResolvedContext {
                provider,
                name: name.to_owned(),
                value: slot.value.clone(),
            })
    }

    /// Mounted value of `name` as seen from `from`.
    #[must_use]
    pub fn context<T: Any + Send + Sync>(&self, from: NodeKey, name: &str) -> Option<Arc<T>> {
        self.resolve(from, name)?.value?.downcast::<T>().ok()
    }

    /// Every item contributed to `registry` by mounted nodes, depth-first.
    #[must_use]
    pub fn features(&self, registry: &str) -> Vec<FeatureItem> {
        let state = self.shared.lock();
        state
            .tree
            .preorder(NodeKey::ROOT)
            .into_iter()
            .filter_map(|k| state.tree.get(k))
            .filter(|n| n.state == NodeState::Mounted)
            .filter_map(|n| n.features.get(registry))
            .flat_map(|items| items.iter().cloned())
            .collect()
    }

    /// Items of `registry` that are of type `T`.
    #[must_use]
    pub fn features_of<T: Any + Send + Sync>(&self, registry: &str) -> Vec<Arc<T>> {
        self.features(registry)
            .into_iter()
            .filter_map(|item| item.downcast::<T>().ok())
            .collect()
    }

    /// Verify parent/child links and the path index.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn check_consistency(&self) -> Result<(), String> {
        self.shared.lock().tree.check_consistency()
    }

    /// The reload manager for this runtime, spawning it on first use.
    ///
    /// Returns `None` when reloading is disabled. Must be called from within
    /// a Tokio runtime.
    #[must_use]
    pub fn reload_manager(&self) -> Option<ReloadManager> {
        if !self.shared.config.reload_enabled {
            return None;
        }
        let mut slot = self
            .shared
            .reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref().filter(|m| !m.is_disposed()) {
            return Some(existing.clone());
        }
        let manager = ReloadManager::spawn(
            Arc::new(WeakRuntime(Arc::downgrade(&self.shared))),
            self.shared.config.reload_debounce,
            Some(self.shared.bus.clone()),
        );
        *slot = Some(manager.clone());
        Some(manager)
    }

    /// Watch the plugin directories and feed changes into the reload manager.
    ///
    /// Returns `None` when watching or reloading is disabled. The watcher
    /// task ends when the reload manager is disposed.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Watch`] if the filesystem watcher cannot be
    /// created.
    #[cfg(feature = "watch")]
    pub fn spawn_watcher(&self) -> RuntimeResult<Option<tokio::task::JoinHandle<()>>> {
        if !self.shared.config.watch {
            return Ok(None);
        }
        let Some(manager) = self.reload_manager() else {
            return Ok(None);
        };
        let config = WatcherConfig {
            roots: self.shared.config.plugin_dirs.clone(),
        };
        let watcher = PluginWatcher::new(config, manager)?;
        Ok(Some(tokio::spawn(watcher.run())))
    }

    /// Report and reset the number of nodes released since the last call.
    fn take_released(&self) -> usize {
        std::mem::take(&mut self.shared.lock().released)
    }

    /// Publish a reclaim hint if anything was released.
    pub(crate) fn reclaim_hint(&self) {
        let released_nodes = self.take_released();
        if released_nodes > 0 {
            debug!(released_nodes, "resources reclaimable");
            self.shared.publish(RuntimeEvent::ResourcesReclaimable {
                metadata: EventMetadata::new("runtime"),
                released_nodes,
            });
        }
    }

    /// Absolute form of `path` under this runtime's base directory.
    #[must_use]
    pub fn absolute(&self, path: impl AsRef<Path>) -> PathBuf {
        self.shared.config.absolute(path.as_ref())
    }
}

#[async_trait]
impl ReloadHandler for Runtime {
    async fn reload_file(&self, path: &Path) -> RuntimeResult<()> {
        Runtime::reload_file(self, path).await.map(|_| ())
    }

    fn batch_completed(&self, _paths: &[PathBuf]) {
        self.reclaim_hint();
    }
}

/// Reload handler that does not keep the runtime alive.
struct WeakRuntime(Weak<Shared>);

impl WeakRuntime {
    fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|shared| Runtime { shared })
    }
}

#[async_trait]
impl ReloadHandler for WeakRuntime {
    async fn reload_file(&self, path: &Path) -> RuntimeResult<()> {
        match self.upgrade() {
            Some(runtime) => Runtime::reload_file(&runtime, path).await.map(|_| ()),
            None => Ok(()),
        }
    }

    fn batch_completed(&self, _paths: &[PathBuf]) {
        if let Some(runtime) = self.upgrade() {
            runtime.reclaim_hint();
        }
    }
}
