//! Recording implementations for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arbor_runtime::{ContextFactory, ContextValue};
use async_trait::async_trait;

/// Shared, ordered log of what test plugins did.
///
/// Clones append to the same log.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    /// Copy of every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many entries equal `entry`.
    #[must_use]
    pub fn count(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| *e == entry)
            .count()
    }

    /// Index of the first entry equal to `entry`.
    #[must_use]
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .position(|e| e == entry)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Value produced by a [`RecordingContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Label the factory was created with.
    pub label: String,
    /// Mount counter of the factory, starting at 1.
    pub generation: usize,
}

/// Context factory that journals `mount:{label}` and `dispose:{label}`.
#[derive(Debug, Clone)]
pub struct RecordingContext {
    label: String,
    journal: Journal,
    mounts: Arc<AtomicUsize>,
    delay: Option<Duration>,
    fail: bool,
}

impl RecordingContext {
    /// Create a factory writing to `journal`.
    #[must_use]
    pub fn new(label: impl Into<String>, journal: &Journal) -> Self {
        Self {
            label: label.into(),
            journal: journal.clone(),
            mounts: Arc::new(AtomicUsize::new(0)),
            delay: None,
            fail: false,
        }
    }

    /// Sleep for `delay` before producing the value.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every mount fail.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// How many times the value has been produced.
    #[must_use]
    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    /// Box into a shareable factory.
    #[must_use]
    pub fn into_factory(self) -> Arc<dyn ContextFactory> {
        Arc::new(self)
    }
}

#[async_trait]
impl ContextFactory for RecordingContext {
    async fn mount(&self) -> anyhow::Result<ContextValue> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            self.journal.record(format!("mount-failed:{}", self.label));
            anyhow::bail!("{} refused to mount", self.label);
        }
        let generation = self.mounts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.journal.record(format!("mount:{}", self.label));
        Ok(Arc::new(Probe {
            label: self.label.clone(),
            generation,
        }))
    }

    async fn dispose(&self, value: ContextValue) -> anyhow::Result<()> {
        drop(value);
        self.journal.record(format!("dispose:{}", self.label));
        Ok(())
    }
}
