//! The root runtime.
//!
//! All tree state lives in one [`RuntimeState`] behind a mutex. Plugin
//! execution, declarations, and every structural change happen while it is
//! held; the lock is never held across an await. Asynchronous work (context
//! mounting, mount hooks, teardown) re-acquires it between steps and
//! re-checks that the node it is working on is still in the expected state.

mod create;
mod dispose;
mod lifecycle;
mod mount;

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arbor_events::{EventBus, EventMetadata, RuntimeEvent};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::error::panic_message;
use crate::loader::ModuleLoader;
use crate::node::{Disposer, EventHandler, NodeKey};
use crate::reload::ReloadManager;
use crate::stack::ExecutionStack;
use crate::tree::Tree;

pub use lifecycle::{BroadcastReport, ReloadOutcome, Runtime, StartReport};

pub(crate) use create::LoadRequest;

thread_local! {
    static HOLDING_STATE: Cell<bool> = const { Cell::new(false) };
}

/// Everything guarded by the runtime lock.
pub(crate) struct RuntimeState {
    pub(crate) tree: Tree,
    pub(crate) stack: ExecutionStack,
    /// Nodes removed since the last reclaim hint.
    pub(crate) released: usize,
    /// Teardown callbacks of nodes that failed during execution, run once
    /// the lock is released.
    pub(crate) deferred: Vec<(NodeKey, Vec<Disposer>)>,
}

/// Lock guard that marks the current thread as holding the runtime state.
pub(crate) struct StateGuard<'a> {
    guard: MutexGuard<'a, RuntimeState>,
}

impl Deref for StateGuard<'_> {
    type Target = RuntimeState;

    fn deref(&self) -> &RuntimeState {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut RuntimeState {
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        HOLDING_STATE.with(|h| h.set(false));
    }
}

/// State shared by [`Runtime`] clones, context handles, and the reloader.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) loader: Arc<dyn ModuleLoader>,
    pub(crate) bus: EventBus,
    state: Mutex<RuntimeState>,
    changes: watch::Sender<u64>,
    pub(crate) reload: Mutex<Option<ReloadManager>>,
}

impl Shared {
    pub(crate) fn new(config: RuntimeConfig, loader: Arc<dyn ModuleLoader>, bus: EventBus) -> Self {
        let tree = Tree::new(&config.base_dir);
        let (changes, _) = watch::channel(0);
        Self {
            config,
            loader,
            bus,
            state: Mutex::new(RuntimeState {
                tree,
                stack: ExecutionStack::new(),
                released: 0,
                deferred: Vec::new(),
            }),
            changes,
            reload: Mutex::new(None),
        }
    }

    /// Acquire the runtime state.
    ///
    /// Poisoning is ignored: every mutation leaves the tree consistent at
    /// each step, and plugin panics are caught before they cross the lock.
    pub(crate) fn lock(&self) -> StateGuard<'_> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        HOLDING_STATE.with(|h| h.set(true));
        StateGuard { guard }
    }

    /// Acquire the state unless this thread already holds it.
    pub(crate) fn try_lock_reentrant(&self) -> Option<StateGuard<'_>> {
        if HOLDING_STATE.with(Cell::get) {
            return None;
        }
        Some(self.lock())
    }

    pub(crate) fn publish(&self, event: RuntimeEvent) {
        self.bus.publish(event);
    }

    /// Wake everything waiting on tree or context changes.
    pub(crate) fn notify_change(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Wait until `ready` holds, re-checking after every change.
    ///
    /// Returns the final value of `ready`; with a deadline it gives up once
    /// the deadline passes.
    pub(crate) async fn wait_until<F>(&self, deadline: Option<Instant>, mut ready: F) -> bool
    where
        F: FnMut(&RuntimeState) -> bool + Send,
    {
        let mut changes = self.changes.subscribe();
        loop {
            changes.borrow_and_update();
            if ready(&self.lock()) {
                return true;
            }
            let changed = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, changes.changed())
                    .await
                    .is_ok_and(|r| r.is_ok()),
                None => changes.changed().await.is_ok(),
            };
            if !changed {
                return ready(&self.lock());
            }
        }
    }

    /// Run teardown callbacks in reverse registration order.
    pub(crate) fn run_disposers(&self, key: NodeKey, disposers: Vec<Disposer>) {
        for disposer in disposers.into_iter().rev() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(disposer)) {
                let error = panic_message(payload.as_ref());
                warn!(node = %key, error = %error, "dispose callback panicked");
                self.publish(RuntimeEvent::HandlerFailed {
                    metadata: EventMetadata::new("runtime"),
                    node: key.as_u64(),
                    event: crate::local_events::DISPOSE.to_owned(),
                    error,
                });
            }
        }
    }

    /// Call local handlers outside the lock. Returns `(delivered, failed)`.
    pub(crate) fn deliver(
        &self,
        key: NodeKey,
        event: &str,
        payload: &serde_json::Value,
        handlers: Vec<EventHandler>,
    ) -> (usize, usize) {
        let mut delivered: usize = 0;
        let mut failed: usize = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => delivered = delivered.saturating_add(1),
                Err(payload) => {
                    failed = failed.saturating_add(1);
                    let error = panic_message(payload.as_ref());
                    warn!(node = %key, event, error = %error, "event handler panicked");
                    self.publish(RuntimeEvent::HandlerFailed {
                        metadata: EventMetadata::new("runtime"),
                        node: key.as_u64(),
                        event: event.to_owned(),
                        error,
                    });
                },
            }
        }
        (delivered, failed)
    }
}
