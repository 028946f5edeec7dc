//! Teardown.
//!
//! Order for one node: mark it disposing, run its teardown callbacks in
//! reverse registration order, dispose its children in reverse creation
//! order, release its contexts, then unlink it from the tree. Consumers are
//! therefore always gone before the values they consumed are released.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arbor_events::{EventMetadata, RuntimeEvent};
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::Shared;
use crate::context::{ContextFactory, ContextValue};
use crate::error::panic_message;
use crate::local_events;
use crate::node::{EventHandler, NodeKey, NodeState};

struct Released {
    name: String,
    factory: Arc<dyn ContextFactory>,
    value: ContextValue,
    consumers: Vec<NodeKey>,
}

impl Shared {
    /// Dispose `key` and its subtree.
    ///
    /// Returns `false` without doing anything if the node is unknown, is the
    /// root, or is already being disposed by another caller.
    pub(crate) fn dispose(self: &Arc<Self>, key: NodeKey) -> BoxFuture<'_, bool> {
        async move {
            if key == NodeKey::ROOT {
                return false;
            }
            let (path, disposers, children) = {
                let mut state = self.lock();
                let Some(node) = state.tree.get_mut(key) else {
                    return false;
                };
                if node.state.is_terminal() {
                    return false;
                }
                node.state = NodeState::Disposing;
                node.mount_hooks.clear();
                (
                    node.id.clone(),
                    std::mem::take(&mut node.disposers),
                    node.children.clone(),
                )
            };
            self.notify_change();
            debug!(node = %key, path = %path.display(), "disposing plugin");

            self.run_disposers(key, disposers);
            for child in children.iter().rev() {
                self.dispose_and_wait(*child).await;
            }
            self.release_contexts(key).await;

            let handlers = {
                let mut state = self.lock();
                let handlers = state
                    .tree
                    .get_mut(key)
                    .map(|node| node.take_handlers(local_events::DISPOSE))
                    .unwrap_or_default();
                state.tree.remove(key);
                state.released = state.released.saturating_add(1);
                handlers
            };
            self.notify_change();

            info!(node = %key, path = %path.display(), "plugin disposed");
            self.publish(RuntimeEvent::NodeDisposed {
                metadata: EventMetadata::new("runtime"),
                node: key.as_u64(),
                path: path.clone(),
            });
            self.deliver(
                key,
                local_events::DISPOSE,
                &serde_json::json!({ "path": path }),
                handlers,
            );
            true
        }
        .boxed()
    }

    /// Dispose `key`, or wait for a teardown already in progress to finish.
    pub(crate) async fn dispose_and_wait(self: &Arc<Self>, key: NodeKey) {
        if !self.dispose(key).await {
            self.wait_until(None, |s| s.tree.get(key).is_none() || key == NodeKey::ROOT)
                .await;
        }
    }

    /// Run every mounted context's dispose and notify surviving consumers.
    ///
    /// Slots stay declared; only their values go.
    pub(crate) async fn release_contexts(&self, key: NodeKey) {
        let released: Vec<Released> = {
            let mut state = self.lock();
            let Some(node) = state.tree.get_mut(key) else {
                return;
            };
            node.provided
                .values_mut()
                .filter_map(|slot| {
                    let value = slot.value.take()?;
                    slot.waiters.clear();
                    Some(Released {
                        name: slot.name.clone(),
                        factory: Arc::clone(&slot.factory),
                        value,
                        consumers: std::mem::take(&mut slot.consumers).into_iter().collect(),
                    })
                })
                .collect()
        };
        if released.is_empty() {
            return;
        }
        self.notify_change();

        for ctx in released {
            match AssertUnwindSafe(ctx.factory.dispose(ctx.value))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => debug!(node = %key, context = %ctx.name, "context released"),
                Ok(Err(e)) => {
                    warn!(node = %key, context = %ctx.name, error = %e, "context dispose failed");
                },
                Err(p) => {
                    warn!(
                        node = %key,
                        context = %ctx.name,
                        error = %panic_message(p.as_ref()),
                        "context dispose panicked"
                    );
                },
            }
            self.notify_release(key, &ctx.name, &ctx.consumers);
        }
    }

    /// Tell every live consumer that `name` from `provider` is gone.
    fn notify_release(&self, provider: NodeKey, name: &str, consumers: &[NodeKey]) {
        let (provider_path, live) = {
            let mut state = self.lock();
            let provider_path = state.tree.get(provider).map(|node| node.id.clone());
            let live: Vec<(NodeKey, Vec<EventHandler>)> = consumers
                .iter()
                .filter_map(|c| {
                    let node = state.tree.get_mut(*c)?;
                    (!node.state.is_terminal())
                        .then(|| (*c, node.take_handlers(local_events::CONTEXT_RELEASED)))
                })
                .collect();
            (provider_path, live)
        };

        self.publish(RuntimeEvent::ContextReleased {
            metadata: EventMetadata::new("runtime"),
            provider: provider.as_u64(),
            name: name.to_owned(),
            consumers: consumers.iter().map(|c| c.as_u64()).collect(),
        });

        let payload = serde_json::json!({
            "name": name,
            "provider": provider.as_u64(),
            "path": provider_path,
        });
        for (consumer, handlers) in live {
            self.deliver(consumer, local_events::CONTEXT_RELEASED, &payload, handlers);
        }
    }
}
