//! Error types for the client crate.

use ledgerlink_auth_engine::AuthEngineError;

use crate::classify::ClassifiedError;

/// Unified error type for outbound provider calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The provider answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body as text.
        body: String,
    },

    /// The request never got an HTTP answer.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// No usable token could be obtained.
    #[error("auth error: {0}")]
    Auth(#[from] AuthEngineError),

    /// A call failed after the retry policy was exhausted.
    #[error("{0}")]
    Api(ClassifiedError),

    /// The client or request is misconfigured.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ClientError>;
