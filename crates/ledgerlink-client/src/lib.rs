//! Outbound provider calls for LedgerLink.
//!
//! Business code never talks to a provider directly; it goes through an
//! [`ApiClient`], which combines:
//!
//! - a [`TokenProvider`](ledgerlink_auth_engine::TokenProvider) for a valid
//!   bearer token on every attempt,
//! - [`with_retry`] for bounded exponential backoff,
//! - [`classify`] for deciding which failures are worth retrying.
//!
//! ```text
//! ApiClient::request
//!   └── with_retry ── send_once ── ensure_valid_token + HTTP
//!         └── on terminal auth_expired: force_refresh, one more attempt
//! ```

pub mod api;
pub mod classify;
pub mod error;
pub mod retry;

pub use api::{
    ApiClient, ApiClientConfig, ApiError, ApiResponse, RequestOptions, ResponseMeta,
    create_api_client,
};
pub use classify::{
    ClassifiedError, Classify, ErrorAction, ErrorCategory, classify_error,
    handle_integration_error,
};
pub use error::{ClientError, Result};
pub use retry::{RetryConfig, RetryResult, with_retry};
