//! Arbor Runtime - a hot-reloadable plugin tree.
//!
//! Plugins are files. Executing a file creates a node in a dependency tree;
//! while it runs, the file declares what it provides and what it needs
//! through a [`Scope`]:
//!
//! - [`Scope::declare_context`]: a named value visible to the node's subtree
//! - [`Scope::use_context`]: a live handle to the nearest provider of a name
//! - [`Scope::use_plugin`]: load another file, attached under its owner
//! - [`Scope::on_mounted`] / [`Scope::on_dispose`]: lifecycle hooks
//!
//! A node mounts once every context it requires resolves from an ancestor
//! and its own contexts have mounted. When a file changes, the
//! [`ReloadManager`] debounces the notification and the [`Runtime`] rebuilds
//! exactly the subtree that file owns.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use arbor_runtime::prelude::*;
//!
//! # async fn example() -> RuntimeResult<()> {
//! let modules = ModuleTable::new();
//! modules.define("/app/plugins/db/index", |scope| {
//!     scope.declare_context("db", context_value(String::from("sqlite::memory:")))?;
//!     Ok(())
//! });
//! modules.define("/app/plugins/db/users", |scope| {
//!     scope.use_context::<String>("db")?;
//!     Ok(())
//! });
//!
//! let config = RuntimeConfig::new("/app").with_entries(["db"]);
//! let runtime = Runtime::new(config, Arc::new(modules.clone()));
//! let report = runtime.start().await;
//! assert!(report.is_clean());
//!
//! let users = runtime.use_plugin("/app/plugins/db/users").await?;
//! let db = runtime.context::<String>(users, "db");
//! assert_eq!(db.as_deref().map(String::as_str), Some("sqlite::memory:"));
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod loader;
pub mod node;
pub mod prelude;
pub mod reload;
pub mod resolver;
pub mod scope;
pub mod stack;
#[cfg(feature = "watch")]
pub mod watcher;

mod runtime;
mod tree;

pub use config::{DEFAULT_MOUNT_TIMEOUT, DEFAULT_RELOAD_DEBOUNCE, RuntimeConfig};
pub use context::{
    ContextFactory, ContextHandle, ContextSlot, ContextValue, ResolvedContext, context_fn,
    context_value,
};
pub use discovery::{EntryResolution, resolve_entries};
pub use error::{RuntimeError, RuntimeResult};
pub use loader::{FnModule, ModuleLoader, ModuleTable, PluginModule, module_fn};
pub use node::{DependencyNode, FeatureItem, NodeInfo, NodeKey, NodeState};
pub use reload::{ReloadHandler, ReloadManager, ReloadStatus};
pub use runtime::{BroadcastReport, ReloadOutcome, Runtime, StartReport};
pub use scope::Scope;
#[cfg(feature = "watch")]
pub use watcher::{PluginWatcher, WatcherConfig};

/// Names of the local events the runtime delivers to node subscriptions.
pub mod local_events {
    /// Delivered to a node right after it mounts. Payload: `{"path": ...}`.
    pub const MOUNTED: &str = "mounted";
    /// Delivered to a node after it has been torn down.
    pub const DISPOSE: &str = "dispose";
    /// Delivered to a consumer when a context it resolved is released.
    /// Payload: `{"name": ..., "provider": <node key>, "path": <provider file>}`.
    pub const CONTEXT_RELEASED: &str = "context-released";
}
