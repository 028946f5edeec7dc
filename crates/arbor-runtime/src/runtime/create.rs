//! Synchronous node creation: execute a file, then its directory.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use arbor_events::{EventMetadata, RuntimeEvent};
use tracing::{debug, warn};

use super::{RuntimeState, Shared};
use crate::error::{RuntimeError, RuntimeResult, panic_message};
use crate::loader::PluginModule;
use crate::node::{NodeKey, NodeState};
use crate::resolver::{Owner, node_name, plugin_dir, resolve_owner};
use crate::scope::Scope;

/// A request to materialize one file.
pub(crate) struct LoadRequest<'p> {
    pub(crate) path: &'p Path,
    /// Explicit parent; `None` lets the resolver pick one.
    pub(crate) parent: Option<NodeKey>,
    /// Node whose execution issued the request.
    pub(crate) caller: Option<NodeKey>,
}

impl Shared {
    /// Create `request.path` and everything it pulls in, under one lock.
    ///
    /// Returns the node (or the error) together with every node created in
    /// the section, in creation order; those still need their mount step.
    pub(crate) fn create_section(
        self: &Arc<Self>,
        request: &LoadRequest<'_>,
    ) -> (RuntimeResult<NodeKey>, Vec<NodeKey>) {
        let mut batch = Vec::new();
        let (result, deferred) = {
            let mut state = self.lock();
            let result = self.load_sync(&mut state, &mut batch, request);
            (result, std::mem::take(&mut state.deferred))
        };
        for (key, disposers) in deferred {
            self.run_disposers(key, disposers);
        }
        (result, batch)
    }

    /// Find or create the node for `request.path`.
    pub(crate) fn load_sync(
        self: &Arc<Self>,
        state: &mut RuntimeState,
        batch: &mut Vec<NodeKey>,
        request: &LoadRequest<'_>,
    ) -> RuntimeResult<NodeKey> {
        if let Some(key) = state.tree.lookup(request.path) {
            return Ok(key);
        }

        let name = node_name(request.path);
        if self.config.is_disabled(&name) {
            debug!(plugin = %name, path = %request.path.display(), "plugin is disabled");
            return Err(RuntimeError::Disabled(name));
        }

        let parent = match request.parent {
            Some(parent) => parent,
            None => self.owner_for(state, batch, request)?,
        };
        // Creating the owner may already have discovered this file.
        if let Some(key) = state.tree.lookup(request.path) {
            return Ok(key);
        }
        if !state.tree.is_live(parent) {
            return Err(RuntimeError::NodeNotFound(parent));
        }
        let key = state
            .tree
            .insert_child(parent, request.path, name)
            .ok_or(RuntimeError::NodeNotFound(parent))?;
        batch.push(key);

        debug!(node = %key, parent = %parent, path = %request.path.display(), "node created");
        self.publish(RuntimeEvent::NodeCreated {
            metadata: EventMetadata::new("runtime"),
            node: key.as_u64(),
            parent: parent.as_u64(),
            path: request.path.to_path_buf(),
        });

        let outcome = self
            .loader
            .load(request.path)
            .and_then(|module| self.execute(state, batch, key, request.path, module.as_ref()));

        match outcome {
            Ok(()) => self.discover_children(state, batch, key, request.path),
            Err(error) => self.fail_execution(state, key, &error),
        }
        Ok(key)
    }

    /// Pick a parent for a file requested without one, creating its owning
    /// plugin first if that plugin is known but not loaded.
    fn owner_for(
        self: &Arc<Self>,
        state: &mut RuntimeState,
        batch: &mut Vec<NodeKey>,
        request: &LoadRequest<'_>,
    ) -> RuntimeResult<NodeKey> {
        loop {
            let owner = resolve_owner(
                &state.tree,
                self.loader.as_ref(),
                &self.config.plugin_dirs,
                request.caller,
                request.path,
            );
            match owner {
                Owner::Node(key) => return Ok(key),
                Owner::Create(module) => {
                    debug!(
                        owner = %module.display(),
                        path = %request.path.display(),
                        "loading owning plugin first"
                    );
                    let owner = self.load_sync(
                        state,
                        batch,
                        &LoadRequest {
                            path: &module,
                            parent: None,
                            caller: request.caller,
                        },
                    )?;
                    if !state.tree.is_live(owner) {
                        return Err(RuntimeError::NodeNotFound(owner));
                    }
                },
            }
        }
    }

    /// Run a module body with `key` on top of the execution stack.
    fn execute(
        self: &Arc<Self>,
        state: &mut RuntimeState,
        batch: &mut Vec<NodeKey>,
        key: NodeKey,
        path: &Path,
        module: &dyn PluginModule,
    ) -> RuntimeResult<()> {
        state.stack.begin(key, path);
        let result = {
            let mut scope = Scope {
                shared: self,
                state: &mut *state,
                batch: &mut *batch,
            };
            panic::catch_unwind(AssertUnwindSafe(|| module.execute(&mut scope)))
        };
        state.stack.end(key);

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RuntimeError::Execution {
                path: path.to_path_buf(),
                message: format!("{e:#}"),
            }),
            Err(payload) => Err(RuntimeError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Create every plugin file inside the node's directory.
    fn discover_children(
        self: &Arc<Self>,
        state: &mut RuntimeState,
        batch: &mut Vec<NodeKey>,
        key: NodeKey,
        path: &Path,
    ) {
        for child in self.loader.discover(&plugin_dir(path)) {
            if !state.tree.is_loading(key) {
                break;
            }
            let request = LoadRequest {
                path: &child,
                parent: Some(key),
                caller: Some(key),
            };
            match self.load_sync(state, batch, &request) {
                Ok(_) => {},
                Err(RuntimeError::Disabled(name)) => {
                    debug!(plugin = %name, "skipping disabled plugin");
                },
                Err(error) => {
                    warn!(path = %child.display(), error = %error, "failed to create child plugin");
                },
            }
        }
    }

    /// Mark a node failed after its body errored or panicked.
    ///
    /// Nodes its body created underneath it never mounted; they are dropped.
    /// All teardown callbacks are deferred until the lock is released.
    fn fail_execution(&self, state: &mut RuntimeState, key: NodeKey, error: &RuntimeError) {
        let descendants: Vec<NodeKey> = state.tree.preorder(key).into_iter().skip(1).collect();
        for child in descendants.into_iter().rev() {
            let Some(mut node) = state.tree.remove(child) else {
                continue;
            };
            state.released = state.released.saturating_add(1);
            state
                .deferred
                .push((child, std::mem::take(&mut node.disposers)));
            self.publish(RuntimeEvent::NodeDisposed {
                metadata: EventMetadata::new("runtime"),
                node: child.as_u64(),
                path: node.id.clone(),
            });
        }

        let Some(node) = state.tree.get_mut(key) else {
            return;
        };
        node.state = NodeState::Failed(error.to_string());
        node.mount_hooks.clear();
        let disposers = std::mem::take(&mut node.disposers);
        let path = node.id.clone();
        state.deferred.push((key, disposers));

        warn!(node = %key, path = %path.display(), error = %error, "plugin execution failed");
        self.publish(RuntimeEvent::MountFailed {
            metadata: EventMetadata::new("runtime"),
            node: key.as_u64(),
            path,
            error: error.to_string(),
        });
    }
}
