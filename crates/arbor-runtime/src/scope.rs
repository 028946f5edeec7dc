//! The declaration surface handed to executing plugin code.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_events::{EventMetadata, RuntimeEvent};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::context::{ContextFactory, ContextHandle, ContextSlot};
use crate::error::{RuntimeError, RuntimeResult};
use crate::node::{DependencyNode, NodeKey};
use crate::resolver::resolve_request;
use crate::runtime::{LoadRequest, RuntimeState, Shared};

/// Execution scope of one plugin file.
///
/// Every declaration attaches to the node on top of the execution stack. A
/// `Scope` only exists while a module's `execute` is running; hooks and
/// handlers registered through it run later, outside of it.
pub struct Scope<'a> {
    pub(crate) shared: &'a Arc<Shared>,
    pub(crate) state: &'a mut RuntimeState,
    pub(crate) batch: &'a mut Vec<NodeKey>,
}

impl Scope<'_> {
    /// The node currently executing.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] if called after execution ended.
    pub fn node(&self) -> RuntimeResult<NodeKey> {
        self.state.stack.current("node")
    }

    /// The file currently executing.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.state.stack.top().map(|f| f.file.clone())
    }

    fn active(&mut self, function: &'static str) -> RuntimeResult<&mut DependencyNode> {
        let key = match self.state.stack.current(function) {
            Ok(key) => key,
            Err(e) => return Err(self.reject(function, e)),
        };
        self.state
            .tree
            .get_mut(key)
            .ok_or(RuntimeError::NodeNotFound(key))
    }

    fn reject(&self, function: &'static str, error: RuntimeError) -> RuntimeError {
        warn!(function, error = %error, "declaration rejected");
        self.shared.publish(RuntimeEvent::RegistrationFailed {
            metadata: EventMetadata::new("scope"),
            function: function.to_owned(),
            error: error.to_string(),
        });
        error
    }

    /// Declare a context this node provides to itself and its descendants.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DuplicateContext`] if this node already
    /// declared `name`. The earlier declaration is kept.
    pub fn declare_context(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn ContextFactory>,
    ) -> RuntimeResult<()> {
        let name = name.into();
        let node = self.active("declare_context")?;
        if node.provided.contains_key(&name) {
            let err = RuntimeError::DuplicateContext {
                name,
                path: node.id.clone(),
            };
            return Err(self.reject("declare_context", err));
        }
        debug!(node = %node.key, context = %name, "context declared");
        node.provided
            .insert(name.clone(), ContextSlot::new(name, factory));
        Ok(())
    }

    /// Require a context. The node will not mount until it resolves.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] outside execution.
    pub fn require_context(&mut self, name: impl Into<String>) -> RuntimeResult<()> {
        let node = self.active("require_context")?;
        node.required.insert(name.into());
        Ok(())
    }

    /// Require a context and get a live handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] outside execution.
    pub fn use_context<T: Any + Send + Sync>(
        &mut self,
        name: impl Into<String>,
    ) -> RuntimeResult<ContextHandle<T>> {
        let name = name.into();
        let consumer = self.active("use_context")?.key;
        self.require_context(name.clone())?;
        Ok(ContextHandle {
            shared: Arc::downgrade(self.shared),
            consumer,
            name,
            _type: PhantomData,
        })
    }

    /// Current value of a context as seen from this node.
    ///
    /// Inside a module body only ancestors' contexts can already be mounted;
    /// use [`use_context`](Self::use_context) to hold on to the name.
    #[must_use]
    pub fn context<T: Any + Send + Sync>(&mut self, name: &str) -> Option<Arc<T>> {
        let key = self.state.stack.current("context").ok()?;
        self.state.tree.consume(key, name)?.downcast::<T>().ok()
    }

    /// Run `hook` once the node's contexts are ready, just before it mounts.
    ///
    /// An error or panic from the hook fails the node.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] outside execution.
    pub fn on_mounted<F, Fut>(&mut self, hook: F) -> RuntimeResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let node = self.active("on_mounted")?;
        node.mount_hooks.push(Box::new(move || hook().boxed()));
        Ok(())
    }

    /// Register a teardown callback. Callbacks run in reverse registration
    /// order when the node is disposed or fails.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] outside execution.
    pub fn on_dispose<F>(&mut self, disposer: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let node = self.active("on_dispose")?;
        node.disposers.push(Box::new(disposer));
        Ok(())
    }

    /// Contribute `item` to the feature registry `registry`.
    ///
    /// The item disappears with the node.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] outside execution.
    pub fn add_feature<T: Any + Send + Sync>(
        &mut self,
        registry: impl Into<String>,
        item: T,
    ) -> RuntimeResult<()> {
        let node = self.active("add_feature")?;
        node.features
            .entry(registry.into())
            .or_default()
            .push(Arc::new(item));
        Ok(())
    }

    /// Subscribe to a local event on this node.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] outside execution.
    pub fn on<F>(&mut self, event: &str, handler: F) -> RuntimeResult<()>
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.active("on")?
            .push_subscription(event, Arc::new(handler), false);
        Ok(())
    }

    /// Subscribe to the next occurrence of a local event on this node.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoActiveNode`] outside execution.
    pub fn once<F>(&mut self, event: &str, handler: F) -> RuntimeResult<()>
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.active("once")?
            .push_subscription(event, Arc::new(handler), true);
        Ok(())
    }

    /// Load another plugin file.
    ///
    /// Relative paths resolve against the directory of the executing file.
    /// The new node is attached under the plugin whose directory contains the
    /// file, or under this node when none does. A file that is already loaded
    /// is returned as is.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Disabled`] for a disabled plugin. Failures
    /// inside the loaded plugin do not propagate; they fail that node only.
    pub fn use_plugin(&mut self, request: impl AsRef<Path>) -> RuntimeResult<NodeKey> {
        let Some(frame) = self.state.stack.top().cloned() else {
            let err = RuntimeError::NoActiveNode {
                function: "use_plugin",
            };
            return Err(self.reject("use_plugin", err));
        };
        let target = resolve_request(&frame.file, request.as_ref());
        self.shared.load_sync(
            self.state,
            self.batch,
            &LoadRequest {
                path: &target,
                parent: None,
                caller: Some(frame.node),
            },
        )
    }
}
