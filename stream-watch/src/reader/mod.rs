//! Page reader interface.
//!
//! A `PageReader` opens a session for a target; the session is the
//! per-target resource handle that the supervisor owns exclusively while the
//! target is running. Sessions never panic or error upward on extraction:
//! a value that cannot be read is simply absent.

mod http;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::Target;

pub use http::{HttpPageReader, ReaderProfile, load_profiles, parse_viewer_count};

/// Shared page reader handle.
pub type SharedReader = Arc<dyn PageReader>;

/// Opens reader sessions for targets.
#[async_trait]
pub trait PageReader: Send + Sync + 'static {
    /// Open and prepare the target's page.
    ///
    /// Any failure (navigation error, timeout, missing element) is reported
    /// as a [`ReadError`]; the caller treats it like a failed read.
    async fn open(&self, target: &Target) -> Result<Box<dyn PageSession>, ReadError>;
}

/// An open page for a single target.
#[async_trait]
pub trait PageSession: Send + 'static {
    /// Refresh the page before the next extraction.
    async fn reload(&mut self) -> Result<(), ReadError> {
        Ok(())
    }

    /// Current viewer count, if it can be extracted.
    async fn read_viewers(&mut self) -> Option<u64>;

    /// Current game or category, if it can be extracted.
    async fn read_game(&mut self) -> Option<String>;

    /// Release the page. Must be idempotent.
    async fn close(&mut self);
}

/// Error type for reader operations.
#[derive(Debug, Clone)]
pub struct ReadError {
    /// Error message.
    pub message: String,
    /// Whether this error is transient (can be retried).
    pub transient: bool,
}

impl ReadError {
    /// Create a transient error (can be retried).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a permanent error (retrying is unlikely to help).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ReadError {}

impl From<crate::Error> for ReadError {
    fn from(err: crate::Error) -> Self {
        ReadError::transient(err.to_string())
    }
}

impl From<reqwest::Error> for ReadError {
    fn from(err: reqwest::Error) -> Self {
        ReadError::transient(err.to_string())
    }
}
