//! Event types for the arbor event bus.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Correlation ID for tracing related events (e.g. one reload batch).
    pub correlation_id: Option<Uuid>,
    /// Source component that generated the event.
    pub source: String,
}

impl EventMetadata {
    /// Create new event metadata.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            source: source.into(),
        }
    }

    /// Set correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// All events published by the plugin runtime.
///
/// Node references are the runtime's numeric node keys; a key is never
/// reused within one process run, so a rebuilt node always carries a new key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    // ========== Runtime Lifecycle ==========
    /// The root runtime finished its initial start.
    RuntimeStarted {
        /// Event metadata.
        metadata: EventMetadata,
        /// Number of entries that reached the mounted state.
        mounted: usize,
        /// Number of entries that failed.
        failed: usize,
    },

    /// The root runtime was shut down.
    RuntimeStopped {
        /// Event metadata.
        metadata: EventMetadata,
    },

    // ========== Node Lifecycle ==========
    /// A node was created and linked into the tree (state: loading).
    NodeCreated {
        /// Event metadata.
        metadata: EventMetadata,
        /// Node key.
        node: u64,
        /// Parent node key.
        parent: u64,
        /// Source file backing the node.
        path: PathBuf,
    },

    /// A node reached the mounted state.
    NodeMounted {
        /// Event metadata.
        metadata: EventMetadata,
        /// Node key.
        node: u64,
        /// Source file backing the node.
        path: PathBuf,
    },

    /// A node failed during execution, readiness, or a mount hook.
    MountFailed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Node key.
        node: u64,
        /// Source file backing the node.
        path: PathBuf,
        /// Failure description.
        error: String,
    },

    /// A node finished teardown and left the tree.
    NodeDisposed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Node key.
        node: u64,
        /// Source file backing the node.
        path: PathBuf,
    },

    // ========== Contexts ==========
    /// A context value finished mounting and is now resolvable.
    ContextProvided {
        /// Event metadata.
        metadata: EventMetadata,
        /// Providing node key.
        provider: u64,
        /// Context name.
        name: String,
    },

    /// A context value was released by its provider.
    ContextReleased {
        /// Event metadata.
        metadata: EventMetadata,
        /// Providing node key.
        provider: u64,
        /// Context name.
        name: String,
        /// Nodes that had resolved this context.
        consumers: Vec<u64>,
    },

    /// A declaration call was rejected.
    RegistrationFailed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Declaration function that was called.
        function: String,
        /// Failure description.
        error: String,
    },

    /// A configured entry could not be located in any plugin directory.
    EntryNotFound {
        /// Event metadata.
        metadata: EventMetadata,
        /// Entry name.
        name: String,
    },

    // ========== Reload ==========
    /// A file change was scheduled for reload (debounce started or restarted).
    ReloadScheduled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Changed file.
        path: PathBuf,
    },

    /// A file is being rebuilt as part of a drain.
    ReloadFile {
        /// Event metadata.
        metadata: EventMetadata,
        /// Changed file.
        path: PathBuf,
    },

    /// Rebuilding a file failed. The rest of the batch still drains.
    ReloadFailed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Changed file.
        path: PathBuf,
        /// Failure description.
        error: String,
    },

    /// A drain finished processing its batch.
    ReloadBatchCompleted {
        /// Event metadata.
        metadata: EventMetadata,
        /// Files processed in drain order.
        paths: Vec<PathBuf>,
    },

    /// Hint that a large amount of state was just released.
    ResourcesReclaimable {
        /// Event metadata.
        metadata: EventMetadata,
        /// Nodes released since the previous hint.
        released_nodes: usize,
    },

    // ========== Local Events ==========
    /// A local event handler panicked or a disposer failed.
    HandlerFailed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Node owning the handler.
        node: u64,
        /// Local event name.
        event: String,
        /// Failure description.
        error: String,
    },
}

impl RuntimeEvent {
    /// Get the event type as a string.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RuntimeStarted { .. } => "runtime_started",
            Self::RuntimeStopped { .. } => "runtime_stopped",
            Self::NodeCreated { .. } => "node_created",
            Self::NodeMounted { .. } => "node_mounted",
            Self::MountFailed { .. } => "mount_failed",
            Self::NodeDisposed { .. } => "node_disposed",
            Self::ContextProvided { .. } => "context_provided",
            Self::ContextReleased { .. } => "context_released",
            Self::RegistrationFailed { .. } => "registration_failed",
            Self::EntryNotFound { .. } => "entry_not_found",
            Self::ReloadScheduled { .. } => "reload_scheduled",
            Self::ReloadFile { .. } => "reload_file",
            Self::ReloadFailed { .. } => "reload_failed",
            Self::ReloadBatchCompleted { .. } => "reload_batch_completed",
            Self::ResourcesReclaimable { .. } => "resources_reclaimable",
            Self::HandlerFailed { .. } => "handler_failed",
        }
    }

    /// Get the event metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::RuntimeStarted { metadata, .. }
            | Self::RuntimeStopped { metadata }
            | Self::NodeCreated { metadata, .. }
            | Self::NodeMounted { metadata, .. }
            | Self::MountFailed { metadata, .. }
            | Self::NodeDisposed { metadata, .. }
            | Self::ContextProvided { metadata, .. }
            | Self::ContextReleased { metadata, .. }
            | Self::RegistrationFailed { metadata, .. }
            | Self::EntryNotFound { metadata, .. }
            | Self::ReloadScheduled { metadata, .. }
            | Self::ReloadFile { metadata, .. }
            | Self::ReloadFailed { metadata, .. }
            | Self::ReloadBatchCompleted { metadata, .. }
            | Self::ResourcesReclaimable { metadata, .. }
            | Self::HandlerFailed { metadata, .. } => metadata,
        }
    }

    /// The source file this event concerns, if any.
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::NodeCreated { path, .. }
            | Self::NodeMounted { path, .. }
            | Self::MountFailed { path, .. }
            | Self::NodeDisposed { path, .. }
            | Self::ReloadScheduled { path, .. }
            | Self::ReloadFile { path, .. }
            | Self::ReloadFailed { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Whether this event reports a contained failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::MountFailed { .. }
                | Self::RegistrationFailed { .. }
                | Self::EntryNotFound { .. }
                | Self::ReloadFailed { .. }
                | Self::HandlerFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_metadata_defaults() {
        let meta = EventMetadata::new("runtime");
        assert_eq!(meta.source, "runtime");
        assert!(meta.correlation_id.is_none());

        let id = Uuid::new_v4();
        let meta = meta.with_correlation_id(id);
        assert_eq!(meta.correlation_id, Some(id));
    }

    #[test]
    fn test_event_type_names() {
        let event = RuntimeEvent::MountFailed {
            metadata: EventMetadata::new("test"),
            node: 3,
            path: PathBuf::from("/plugins/a"),
            error: "boom".into(),
        };
        assert_eq!(event.event_type(), "mount_failed");
        assert!(event.is_failure());
        assert_eq!(event.path(), Some(&PathBuf::from("/plugins/a")));

        let event = RuntimeEvent::RuntimeStopped {
            metadata: EventMetadata::new("test"),
        };
        assert_eq!(event.event_type(), "runtime_stopped");
        assert!(!event.is_failure());
        assert!(event.path().is_none());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RuntimeEvent::ReloadFile {
            metadata: EventMetadata::new("reload"),
            path: PathBuf::from("/plugins/a"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "reload_file");
        assert_eq!(json["path"], "/plugins/a");
        assert_eq!(json["metadata"]["source"], "reload");
    }
}
