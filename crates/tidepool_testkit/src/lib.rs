//! # Tidepool Testkit
//!
//! Test utilities for Tidepool.
//!
//! This crate provides:
//! - Row builders and a fully wired [`TestEngine`]
//! - [`ReferenceBackend`], a stateful in-memory backend with fault injection
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidepool_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs_a_task() {
//!     let fixture = TestEngine::memory();
//!     fixture.backend.seed(Table::Tasks, task("t-1", "u-1", "Review"));
//!     assert!(fixture.sync().sync("u-1", SyncOptions::forced()).await);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use backend::*;
pub use fixtures::*;
pub use generators::*;
