//! Arbor Test - shared test utilities for the arbor plugin runtime.
//!
//! This crate provides recording context factories, an event log, and
//! runtime fixtures used by the integration tests of the runtime crates.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! arbor-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use arbor_test::{Journal, RecordingContext, plugin, test_runtime};
//!
//! #[tokio::test]
//! async fn test_db_mounts() {
//!     let journal = Journal::new();
//!     let (runtime, modules) = test_runtime(["db"]);
//!     let factory = RecordingContext::new("db", &journal).into_factory();
//!     modules.define(plugin("db"), move |scope| {
//!         scope.declare_context("db", factory.clone())?;
//!         Ok(())
//!     });
//!     assert!(runtime.start().await.is_clean());
//!     assert_eq!(journal.entries(), vec!["mount:db"]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
