//! Error types for the change-feed client.
//!
//! Only conditions that end a session cross the session boundary. Setup
//! failures are returned from [`ChangeSession::start`]; mid-stream failures
//! are reported to listeners as a [`DisconnectReason`].
//!
//! [`ChangeSession::start`]: crate::changes::ChangeSession::start
//! [`DisconnectReason`]: crate::changes::DisconnectReason

use crate::client::is_retryable_status;
use std::time::Duration;
use thiserror::Error;

/// Result type for feed operations
pub type Result<T> = std::result::Result<T, FeedError>;

/// Errors produced by the transport, the cursor lookup and the session.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Request could not be issued (DNS, connect, TLS, I/O)
    #[error("HTTP error: {0}")]
    Http(String),

    /// No response headers arrived within the initial-response timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Server answered with a non-success status before any body was produced
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The stream failed after it was opened
    #[error("Disconnected mid-stream: {0}")]
    Disconnected(String),

    /// `start()` called while a feed request is already active
    #[error("Change session is already running")]
    AlreadyRunning,

    /// Subscriber registration attempted after the session was started
    #[error("Subscribers can only be registered before start")]
    AlreadyStarted,

    /// Database info response did not carry a current sequence
    #[error("Database info for {0} has no update_seq")]
    MissingSequence(String),

    /// Base URL or database path could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FeedError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Http(_) | FeedError::Timeout(_) | FeedError::Disconnected(_) => true,
            FeedError::Status { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::Http(err.to_string())
    }
}
