//! stream-watch library crate.
//!
//! Supervises a dynamic set of (website, channel) targets, reads their
//! viewer counts through a pluggable page reader and persists the results.

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod reader;
pub mod registry;
pub mod scheduler;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use error::{Error, Result};
