//! The asynchronous mount phase.
//!
//! Every node created in one section mounts concurrently. A node first waits
//! (bounded by the mount timeout) for contexts provided by other nodes, then
//! mounts its own contexts, runs its mount hooks, and becomes mounted. Any
//! failure marks the node failed and tears down what it had built.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use arbor_events::{EventMetadata, RuntimeEvent};
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Shared;
use crate::context::ContextFactory;
use crate::error::{RuntimeError, RuntimeResult, panic_message};
use crate::local_events;
use crate::node::{NodeKey, NodeState};

impl Shared {
    /// Mount every node of a creation section.
    pub(crate) async fn mount_batch(self: &Arc<Self>, batch: Vec<NodeKey>) {
        if batch.is_empty() {
            return;
        }
        futures::future::join_all(batch.into_iter().map(|key| self.mount_node(key))).await;
    }

    async fn mount_node(self: &Arc<Self>, key: NodeKey) {
        if let Err(error) = self.try_mount(key).await {
            self.fail_node(key, &error).await;
        }
    }

    fn ensure_loading(&self, key: NodeKey) -> RuntimeResult<()> {
        if self.lock().tree.is_loading(key) {
            Ok(())
        } else {
            Err(RuntimeError::Disposed(key))
        }
    }

    /// Wait until the node's required contexts resolve to mounted values.
    async fn await_contexts(
        &self,
        key: NodeKey,
        started: Instant,
        deadline: Instant,
        foreign_only: bool,
    ) -> RuntimeResult<()> {
        self.lock().tree.set_waiting(key, true);
        self.wait_until(Some(deadline), |s| {
            !s.tree.is_loading(key) || s.tree.unresolved(key, foreign_only).is_empty()
        })
        .await;

        let missing = {
            let mut state = self.lock();
            state.tree.set_waiting(key, false);
            state.tree.unresolved(key, foreign_only)
        };
        self.ensure_loading(key)?;
        if missing.is_empty() {
            return Ok(());
        }
        let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Err(RuntimeError::UnresolvedContexts {
            names: missing,
            waited_ms,
        })
    }

    async fn try_mount(self: &Arc<Self>, key: NodeKey) -> RuntimeResult<()> {
        if !self.lock().tree.is_loading(key) {
            // Failed during execution or already torn down.
            return Ok(());
        }
        let started = Instant::now();
        #[allow(clippy::arithmetic_side_effects)]
        // Instant + Duration cannot overflow for a bounded timeout
        let deadline = started + self.config.mount_timeout;

        self.await_contexts(key, started, deadline, true).await?;
        self.mount_own_contexts(key).await?;
        self.await_contexts(key, started, deadline, false).await?;

        let hooks = {
            let mut state = self.lock();
            state.tree.record_consumers(key);
            match state.tree.get_mut(key) {
                Some(node) => std::mem::take(&mut node.mount_hooks),
                None => return Err(RuntimeError::Disposed(key)),
            }
        };
        for hook in hooks {
            let future = panic::catch_unwind(AssertUnwindSafe(hook))
                .map_err(|p| RuntimeError::Panicked(panic_message(p.as_ref())))?;
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => return Err(RuntimeError::HookFailed(format!("{e:#}"))),
                Err(p) => return Err(RuntimeError::Panicked(panic_message(p.as_ref()))),
            }
            self.ensure_loading(key)?;
        }

        let (path, handlers) = {
            let mut state = self.lock();
            let Some(node) = state.tree.get_mut(key) else {
                return Err(RuntimeError::Disposed(key));
            };
            if node.state != NodeState::Loading {
                return Err(RuntimeError::Disposed(key));
            }
            node.state = NodeState::Mounted;
            (node.id.clone(), node.take_handlers(local_events::MOUNTED))
        };
        self.notify_change();

        info!(node = %key, path = %path.display(), "plugin mounted");
        self.publish(RuntimeEvent::NodeMounted {
            metadata: EventMetadata::new("runtime"),
            node: key.as_u64(),
            path: path.clone(),
        });
        self.deliver(
            key,
            local_events::MOUNTED,
            &serde_json::json!({ "path": path }),
            handlers,
        );
        Ok(())
    }

    /// Mount every context the node declares, in name order.
    async fn mount_own_contexts(&self, key: NodeKey) -> RuntimeResult<()> {
        let pending: Vec<(String, Arc<dyn ContextFactory>)> = {
            let state = self.lock();
            state
                .tree
                .get(key)
                .map(|node| {
                    node.provided
                        .values()
                        .filter(|slot| slot.value.is_none())
                        .map(|slot| (slot.name.clone(), Arc::clone(&slot.factory)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (name, factory) in pending {
            let value = match AssertUnwindSafe(factory.mount()).catch_unwind().await {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => {
                    return Err(RuntimeError::ContextMount {
                        name,
                        message: format!("{e:#}"),
                    });
                },
                Err(p) => return Err(RuntimeError::Panicked(panic_message(p.as_ref()))),
            };

            let stored = {
                let mut state = self.lock();
                match state.tree.get_mut(key) {
                    Some(node) if node.state == NodeState::Loading => {
                        node.provided.get_mut(&name).is_some_and(|slot| {
                            slot.value = Some(Arc::clone(&value));
                            true
                        })
                    },
                    _ => false,
                }
            };
            if !stored {
                // Torn down while mounting; nobody saw the value.
                if let Err(e) = factory.dispose(value).await {
                    warn!(node = %key, context = %name, error = %e, "context dispose failed");
                }
                return Err(RuntimeError::Disposed(key));
            }

            self.notify_change();
            debug!(node = %key, context = %name, "context mounted");
            self.publish(RuntimeEvent::ContextProvided {
                metadata: EventMetadata::new("runtime"),
                provider: key.as_u64(),
                name,
            });
        }
        Ok(())
    }

    /// Fail a loading node and tear down what it built. The node stays in
    /// the tree, marked failed, until it is disposed.
    pub(crate) async fn fail_node(self: &Arc<Self>, key: NodeKey, error: &RuntimeError) {
        let (path, disposers, children) = {
            let mut state = self.lock();
            let Some(node) = state.tree.get_mut(key) else {
                return;
            };
            if node.state != NodeState::Loading {
                return;
            }
            node.state = NodeState::Failed(error.to_string());
            node.mount_hooks.clear();
            (
                node.id.clone(),
                std::mem::take(&mut node.disposers),
                node.children.clone(),
            )
        };
        self.notify_change();

        warn!(node = %key, path = %path.display(), error = %error, "plugin failed to mount");
        self.publish(RuntimeEvent::MountFailed {
            metadata: EventMetadata::new("runtime"),
            node: key.as_u64(),
            path,
            error: error.to_string(),
        });

        self.run_disposers(key, disposers);
        for child in children.iter().rev() {
            self.dispose_and_wait(*child).await;
        }
        self.release_contexts(key).await;
    }
}
