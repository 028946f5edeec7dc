//! Runtime error types.

use std::any::Any;
use std::path::PathBuf;

use crate::node::NodeKey;

/// Errors from plugin tree operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// A declaration function was called while no node was executing.
    #[error("{function} called outside plugin execution")]
    NoActiveNode {
        /// The declaration function that was called.
        function: &'static str,
    },

    /// A node declared the same context name twice.
    #[error("context '{name}' is already declared by {path}")]
    DuplicateContext {
        /// Context name.
        name: String,
        /// Source file of the declaring node.
        path: PathBuf,
    },

    /// The plugin name is on the disabled list.
    #[error("plugin '{0}' is disabled")]
    Disabled(String),

    /// The loader has no module for this path.
    #[error("no plugin module at {0}")]
    ModuleNotFound(PathBuf),

    /// The node key does not refer to a live node.
    #[error("node not found: {0}")]
    NodeNotFound(NodeKey),

    /// Required contexts never became available within the mount timeout.
    #[error("unresolved contexts after {waited_ms}ms: {}", names.join(", "))]
    UnresolvedContexts {
        /// Context names that could not be resolved.
        names: Vec<String>,
        /// How long the node waited.
        waited_ms: u64,
    },

    /// Executing a plugin file returned an error.
    #[error("plugin execution failed in {path}: {message}")]
    Execution {
        /// Source file of the plugin.
        path: PathBuf,
        /// Error chain rendered as text.
        message: String,
    },

    /// A context factory failed to produce its value.
    #[error("context '{name}' failed to mount: {message}")]
    ContextMount {
        /// Context name.
        name: String,
        /// Failure reason.
        message: String,
    },

    /// A mount hook returned an error.
    #[error("mount hook failed: {0}")]
    HookFailed(String),

    /// Plugin code panicked.
    #[error("plugin panicked: {0}")]
    Panicked(String),

    /// The node was torn down before it finished mounting.
    #[error("node {0} was disposed while mounting")]
    Disposed(NodeKey),

    /// The filesystem watcher could not be set up.
    #[error("file watcher error: {0}")]
    Watch(String),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Render a panic payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let code = 7;
        let payload = std::panic::catch_unwind(|| panic!("formatted {code}")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(42_u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_unresolved_lists_names() {
        let err = RuntimeError::UnresolvedContexts {
            names: vec!["db".into(), "cache".into()],
            waited_ms: 250,
        };
        assert_eq!(err.to_string(), "unresolved contexts after 250ms: db, cache");
    }
}
