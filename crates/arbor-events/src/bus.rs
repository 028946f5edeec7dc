//! Broadcast bus carrying [`RuntimeEvent`]s to hosts.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{trace, warn};

use crate::event::RuntimeEvent;

/// Events buffered per receiver before the slowest one starts losing them.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Fan-out of runtime events.
///
/// Each receiver sees every event published after it subscribed, in publish
/// order. Publishing never blocks; with nobody listening the event is
/// dropped. Clones share one channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<RuntimeEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Bus with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Bus buffering up to `capacity` events per receiver (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Send `event` to every current receiver and return how many there were.
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        let event_type = event.event_type();
        let delivered = self.sender.send(Arc::new(event)).unwrap_or(0);
        trace!(event_type, delivered, "event published");
        delivered
    }

    /// Receive everything.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.receiver(Interest::All)
    }

    /// Receive only events whose [`RuntimeEvent::event_type`] is `event_type`.
    #[must_use]
    pub fn subscribe_type(&self, event_type: &'static str) -> EventReceiver {
        self.receiver(Interest::Type(event_type))
    }

    /// Receive only contained failures (see [`RuntimeEvent::is_failure`]).
    #[must_use]
    pub fn subscribe_failures(&self) -> EventReceiver {
        self.receiver(Interest::Failures)
    }

    /// Live receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-receiver buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn receiver(&self, interest: Interest) -> EventReceiver {
        EventReceiver {
            inner: self.sender.subscribe(),
            interest,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum Interest {
    All,
    Type(&'static str),
    Failures,
}

impl Interest {
    fn wants(self, event: &RuntimeEvent) -> bool {
        match self {
            Self::All => true,
            Self::Type(event_type) => event.event_type() == event_type,
            Self::Failures => event.is_failure(),
        }
    }
}

/// One subscription to an [`EventBus`].
///
/// A receiver that falls more than the bus capacity behind loses the oldest
/// events; it logs the gap and carries on with what is left.
#[derive(Debug)]
pub struct EventReceiver {
    inner: broadcast::Receiver<Arc<RuntimeEvent>>,
    interest: Interest,
}

impl EventReceiver {
    /// Wait for the next matching event. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Arc<RuntimeEvent>> {
        loop {
            match self.inner.recv().await {
                Ok(event) if self.interest.wants(&event) => return Some(event),
                Ok(_) => {},
                Err(RecvError::Lagged(missed)) => lagged(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, if any.
    pub fn try_recv(&mut self) -> Option<Arc<RuntimeEvent>> {
        loop {
            match self.inner.try_recv() {
                Ok(event) if self.interest.wants(&event) => return Some(event),
                Ok(_) => {},
                Err(TryRecvError::Lagged(missed)) => lagged(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Every matching event already buffered, oldest first.
    pub fn drain(&mut self) -> Vec<Arc<RuntimeEvent>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

fn lagged(missed: u64) {
    warn!(missed, "event receiver fell behind, oldest events lost");
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::event::EventMetadata;

    fn stopped() -> RuntimeEvent {
        RuntimeEvent::RuntimeStopped {
            metadata: EventMetadata::new("test"),
        }
    }

    fn reload_file(path: &str) -> RuntimeEvent {
        RuntimeEvent::ReloadFile {
            metadata: EventMetadata::new("test"),
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_fresh_bus_has_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.capacity(), DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(stopped()), 0);
        assert_eq!(EventBus::with_capacity(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_the_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();

        assert_eq!(bus.publish(stopped()), 2);
        assert_eq!(first.recv().await.unwrap().event_type(), "runtime_stopped");
        assert_eq!(second.recv().await.unwrap().event_type(), "runtime_stopped");
    }

    #[tokio::test]
    async fn test_typed_subscription_skips_other_events() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe_type("reload_file");

        bus.publish(stopped());
        bus.publish(reload_file("/plugins/a"));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.path(), Some(&PathBuf::from("/plugins/a")));
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn test_failure_subscription() {
        let bus = EventBus::new();
        let mut failures = bus.subscribe_failures();

        bus.publish(reload_file("/plugins/a"));
        bus.publish(RuntimeEvent::ReloadFailed {
            metadata: EventMetadata::new("test"),
            path: PathBuf::from("/plugins/a"),
            error: "boom".into(),
        });

        let seen = failures.drain();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type(), "reload_failed");
    }

    #[test]
    fn test_drain_keeps_publish_order() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(stopped());
        bus.publish(RuntimeEvent::EntryNotFound {
            metadata: EventMetadata::new("test"),
            name: "missing".into(),
        });

        let types: Vec<_> = receiver.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, ["runtime_stopped", "entry_not_found"]);
        assert!(receiver.drain().is_empty());
    }

    #[test]
    fn test_slow_receiver_keeps_the_newest_events() {
        let bus = EventBus::with_capacity(2);
        let mut receiver = bus.subscribe();
        for n in 0..5 {
            bus.publish(reload_file(&format!("/plugins/{n}")));
        }

        let paths: Vec<_> = receiver
            .drain()
            .iter()
            .filter_map(|e| e.path().cloned())
            .collect();
        assert_eq!(
            paths,
            [PathBuf::from("/plugins/3"), PathBuf::from("/plugins/4")]
        );
    }
}
