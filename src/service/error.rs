//! Errors raised by the external collaborators.
//!
//! [`ServiceError::is_transient`] drives retry decisions: transient failures
//! are retried on the next poll tick or fetch attempt, the rest surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// HTTP 429. `retry_after_ms` is how long the server asked us to wait.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success HTTP status.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The addressed entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The response body did not match the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),

    /// A stream or channel closed underneath us.
    #[error("channel closed")]
    ChannelClosed,

    /// DNS, connection refused, timeouts.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::RateLimited { .. }
            | ServiceError::Network(_)
            | ServiceError::ChannelClosed => true,
            ServiceError::Api { status, .. } => *status >= 500,
            ServiceError::NotFound(_) | ServiceError::Decode(_) => false,
        }
    }
}
