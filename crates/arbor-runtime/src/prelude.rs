//! Prelude module - commonly used types for convenient import.
//!
//! Use `use arbor_runtime::prelude::*;` to import all essential types.

pub use crate::{
    ContextFactory, ContextHandle, ContextValue, ModuleLoader, ModuleTable, NodeKey, NodeState,
    ReloadManager, Runtime, RuntimeConfig, RuntimeError, RuntimeResult, Scope, context_fn,
    context_value, local_events, module_fn,
};
