//! Error types for the dispatch pipeline.
//!
//! Only request-fatal conditions live in [`VolleyError`]. Per-recipient problems
//! (malformed identifiers, provider rejections, timeouts) are captured as data in
//! [`ClassificationResult`](crate::ClassificationResult) and
//! [`BulkDispatchSummary`](crate::BulkDispatchSummary) instead.

use thiserror::Error;

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Main error type for the dispatch pipeline.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Lookup or write against the recipient store failed.
    ///
    /// During classification this aborts the whole batch; callers must retry the
    /// entire batch rather than assume partial progress.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Missing credentials or unusable limits, raised once at construction time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The request exceeds a configured bound (batch size, message length, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// Returns true for errors that abort the whole request rather than a single item.
    pub fn is_fatal_for_request(&self) -> bool {
        matches!(
            self,
            VolleyError::Persistence(_) | VolleyError::Configuration(_) | VolleyError::Validation(_)
        )
    }
}
