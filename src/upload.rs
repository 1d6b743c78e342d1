//! Result upload to an OpenTMI server.
//!
//! Uploading happens once, at the end of a run. The
//! [`UploadCoordinator`] exchanges the access token for a [`SessionToken`]
//! and then submits every record through a bounded pool of concurrent
//! submissions, counting what made it and what did not.
//!
//! ```text
//! access token ──► authenticate() ──► SessionToken
//!                                          │
//! records ──► submit() × N (≤ W in flight) ┴──► UploadOutcome {succeeded, failed}
//! ```
//!
//! The remote side is abstracted by [`ResultClient`] so the coordinator can
//! be driven by [`HttpResultClient`] in production and by in-memory clients
//! in tests.

pub mod client;
pub mod coordinator;

use std::fmt;
use std::time::Duration;

pub use client::{HttpResultClient, ResultClient};
pub use coordinator::UploadCoordinator;

/// Result type for upload operations.
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors raised while talking to the server.
///
/// Only [`Authentication`](UploadError::Authentication) affects more than
/// one record; every other variant is local to the submission that hit it.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The access token could not be exchanged for a session.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server rejected a result.
    #[error("Submission failed: {0}")]
    Submission(String),

    /// A submission did not finish within its deadline.
    #[error("Submission timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Credential obtained once per run and shared read-only by all
/// submissions.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

/// Aggregate counts for one upload pass.
///
/// `succeeded + failed` always equals the number of records handed to the
/// coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl UploadOutcome {
    /// Outcome of a batch that never reached the submission stage.
    pub fn all_failed(count: usize) -> Self {
        Self {
            succeeded: 0,
            failed: count,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Uploaded {} results successfully, {} failed",
            self.succeeded, self.failed
        )
    }
}
