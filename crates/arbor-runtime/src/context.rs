//! Named contexts: values a node provides to its subtree.
//!
//! A node declares a context with a [`ContextFactory`]. The factory's
//! `mount` runs once the node's own requirements are satisfied, and the
//! resulting [`ContextValue`] is visible to the node and every descendant
//! until a nearer node shadows the name. `dispose` runs exactly once when
//! the providing node is torn down.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::node::NodeKey;
use crate::runtime::Shared;

/// A mounted context value.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Produces and releases a context value.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    /// Produce the value. Runs at most once per providing node.
    async fn mount(&self) -> anyhow::Result<ContextValue>;

    /// Release the value. Runs exactly once per successful mount.
    async fn dispose(&self, value: ContextValue) -> anyhow::Result<()> {
        drop(value);
        Ok(())
    }
}

struct FnContext<M, D> {
    mount: M,
    dispose: D,
}

#[async_trait]
impl<M, MF, D, DF> ContextFactory for FnContext<M, D>
where
    M: Fn() -> MF + Send + Sync,
    MF: Future<Output = anyhow::Result<ContextValue>> + Send,
    D: Fn(ContextValue) -> DF + Send + Sync,
    DF: Future<Output = anyhow::Result<()>> + Send,
{
    async fn mount(&self) -> anyhow::Result<ContextValue> {
        (self.mount)().await
    }

    async fn dispose(&self, value: ContextValue) -> anyhow::Result<()> {
        (self.dispose)(value).await
    }
}

/// Build a context factory from a pair of async closures.
pub fn context_fn<M, MF, D, DF>(mount: M, dispose: D) -> Arc<dyn ContextFactory>
where
    M: Fn() -> MF + Send + Sync + 'static,
    MF: Future<Output = anyhow::Result<ContextValue>> + Send + 'static,
    D: Fn(ContextValue) -> DF + Send + Sync + 'static,
    DF: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnContext { mount, dispose })
}

struct StaticContext(ContextValue);

#[async_trait]
impl ContextFactory for StaticContext {
    async fn mount(&self) -> anyhow::Result<ContextValue> {
        Ok(Arc::clone(&self.0))
    }
}

/// A factory that always mounts the same value and needs no cleanup.
pub fn context_value<T: Any + Send + Sync>(value: T) -> Arc<dyn ContextFactory> {
    Arc::new(StaticContext(Arc::new(value)))
}

/// A context declared by a node.
pub struct ContextSlot {
    pub(crate) name: String,
    pub(crate) factory: Arc<dyn ContextFactory>,
    pub(crate) value: Option<ContextValue>,
    /// Nodes blocked in mount waiting for this value.
    pub(crate) waiters: BTreeSet<NodeKey>,
    /// Nodes that resolved this slot and must hear about its release.
    pub(crate) consumers: BTreeSet<NodeKey>,
}

impl ContextSlot {
    pub(crate) fn new(name: String, factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            name,
            factory,
            value: None,
            waiters: BTreeSet::new(),
            consumers: BTreeSet::new(),
        }
    }

    /// Context name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the value has mounted.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.value.is_some()
    }
}

impl fmt::Debug for ContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("name", &self.name)
            .field("mounted", &self.value.is_some())
            .field("waiters", &self.waiters)
            .field("consumers", &self.consumers)
            .finish_non_exhaustive()
    }
}

/// Result of resolving a context name from a node.
#[derive(Clone)]
pub struct ResolvedContext {
    /// Node that provides the value.
    pub provider: NodeKey,
    /// Context name.
    pub name: String,
    /// Mounted value, if the provider has mounted it.
    pub value: Option<ContextValue>,
}

impl fmt::Debug for ResolvedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedContext")
            .field("provider", &self.provider)
            .field("name", &self.name)
            .field("mounted", &self.value.is_some())
            .finish()
    }
}

/// Live accessor for a context a node consumes.
///
/// The handle never caches: every call resolves the name again from the
/// consuming node, so after a provider is rebuilt the handle yields the new
/// value (or nothing while it is mounting).
pub struct ContextHandle<T: ?Sized = dyn Any + Send + Sync> {
    pub(crate) shared: Weak<Shared>,
    pub(crate) consumer: NodeKey,
    pub(crate) name: String,
    pub(crate) _type: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized> Clone for ContextHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
            consumer: self.consumer,
            name: self.name.clone(),
            _type: PhantomData,
        }
    }
}

impl<T: ?Sized> fmt::Debug for ContextHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("consumer", &self.consumer)
            .field("name", &self.name)
            .finish()
    }
}

impl<T: ?Sized> ContextHandle<T> {
    /// Context name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node the handle resolves from.
    #[must_use]
    pub fn consumer(&self) -> NodeKey {
        self.consumer
    }

    /// Resolve the current untyped value.
    ///
    /// Returns `None` if the runtime is gone, the consumer has been disposed,
    /// no ancestor provides the name, or the provider has not mounted it.
    /// Inside a module body it also returns `None`; use
    /// [`Scope::context`](crate::Scope::context) there.
    #[must_use]
    pub fn raw(&self) -> Option<ContextValue> {
        let shared = self.shared.upgrade()?;
        let mut state = shared.try_lock_reentrant()?;
        state.tree.consume(self.consumer, &self.name)
    }

    /// Whether a mounted value currently resolves.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.raw().is_some()
    }

    /// Node currently providing the name, mounted or not.
    #[must_use]
    pub fn provider(&self) -> Option<NodeKey> {
        let shared = self.shared.upgrade()?;
        let state = shared.try_lock_reentrant()?;
        state
            .tree
            .resolve(self.consumer, &self.name)
            .map(|(provider, _)| provider)
    }
}

impl<T: Any + Send + Sync> ContextHandle<T> {
    /// Resolve the current value as `T`.
    ///
    /// Returns `None` under the same conditions as [`raw`](Self::raw), or if
    /// the mounted value has a different type.
    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        self.raw()?.downcast::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_context_fn_runs_both_halves() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let factory = context_fn(
            || async { Ok(Arc::new(41_u32) as ContextValue) },
            move |value| {
                let counter = Arc::clone(&counter);
                async move {
                    assert_eq!(value.downcast_ref::<u32>(), Some(&41));
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        let value = factory.mount().await.unwrap();
        factory.dispose(value).await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_context_value_shares_one_allocation() {
        let factory = context_value(String::from("shared"));
        let a = factory.mount().await.unwrap();
        let b = factory.mount().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(factory.dispose(a).await.is_ok());
    }
}
