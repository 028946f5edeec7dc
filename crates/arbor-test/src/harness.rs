//! Event collection helpers.

use std::sync::Arc;
use std::time::Duration;

use arbor_events::{EventReceiver, RuntimeEvent};

/// Buffers runtime events for assertions.
pub struct EventLog {
    receiver: EventReceiver,
    seen: Vec<Arc<RuntimeEvent>>,
}

impl EventLog {
    /// Start collecting from `receiver`.
    #[must_use]
    pub fn new(receiver: EventReceiver) -> Self {
        Self {
            receiver,
            seen: Vec::new(),
        }
    }

    /// Pull in everything published so far and return all collected events.
    pub fn events(&mut self) -> &[Arc<RuntimeEvent>] {
        self.seen.extend(self.receiver.drain());
        &self.seen
    }

    /// Event type names collected so far, in publish order.
    pub fn types(&mut self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event_type()).collect()
    }

    /// How many collected events have type `event_type`.
    pub fn count(&mut self, event_type: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    /// Collected events of type `event_type`.
    pub fn of_type(&mut self, event_type: &str) -> Vec<Arc<RuntimeEvent>> {
        self.events()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// First event of type `event_type`, waiting up to `timeout` for one to
    /// arrive if none has been collected yet.
    ///
    /// Events already collected by [`count`](Self::count) and friends are
    /// searched too. Events seen while waiting are kept.
    pub async fn wait_for(
        &mut self,
        event_type: &str,
        timeout: Duration,
    ) -> Option<Arc<RuntimeEvent>> {
        self.seen.extend(self.receiver.drain());
        if let Some(found) = self
            .seen
            .iter()
            .find(|e| e.event_type() == event_type)
        {
            return Some(Arc::clone(found));
        }
        let receiver = &mut self.receiver;
        let seen = &mut self.seen;
        tokio::time::timeout(timeout, async {
            while let Some(event) = receiver.recv().await {
                seen.push(Arc::clone(&event));
                if event.event_type() == event_type {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Forget collected events.
    pub fn clear(&mut self) {
        self.seen.extend(self.receiver.drain());
        self.seen.clear();
    }
}
