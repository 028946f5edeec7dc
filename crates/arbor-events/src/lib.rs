//! Arbor Events - what the arbor plugin runtime tells its host.
//!
//! The runtime contains plugin failures instead of returning them: a module
//! that errors, a hook that panics, or a reload that blows up each becomes a
//! [`RuntimeEvent`] on the [`EventBus`]. Hosts subscribe to everything, to
//! one event type, or to failures only.
//!
//! ```rust
//! use arbor_events::{EventBus, EventMetadata, RuntimeEvent};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let mut failures = bus.subscribe_failures();
//!
//! bus.publish(RuntimeEvent::EntryNotFound {
//!     metadata: EventMetadata::new("host"),
//!     name: "chat".into(),
//! });
//!
//! let event = failures.recv().await.unwrap();
//! assert_eq!(event.event_type(), "entry_not_found");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod bus;
mod event;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::{EventMetadata, RuntimeEvent};
