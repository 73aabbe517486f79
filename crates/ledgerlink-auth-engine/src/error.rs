//! Errors from adapters, the connect flow and token refresh.
//!
//! Credential-state variants (`CredentialNotFound`, `CredentialInactive`,
//! `TokenExpired`, `MissingRefreshToken`) all mean the user has to
//! reconnect; retrying will not help.

use ledgerlink_store::StoreError;
use ledgerlink_vault::VaultError;

#[derive(Debug, thiserror::Error)]
pub enum AuthEngineError {
    /// The OAuth callback carried a state that is unknown, already used,
    /// expired, or was issued for a different provider.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    /// The authorization code exchange or refresh grant was rejected by the
    /// authorization server.
    #[error("invalid grant: {reason}")]
    InvalidGrant {
        /// Explanation from the authorization server.
        reason: String,
    },

    /// The token endpoint answered with an unexpected non-success status.
    #[error("token endpoint returned HTTP {status}: {reason}")]
    TokenEndpoint {
        /// HTTP status code.
        status: u16,
        /// Response body or OAuth error description.
        reason: String,
    },

    /// The access token has expired and no refresh token is available.
    #[error("token expired for provider {provider}")]
    TokenExpired {
        /// The provider whose token expired.
        provider: String,
    },

    /// No credential has ever been stored for the provider.
    #[error("no credentials stored for provider {provider}")]
    CredentialNotFound {
        /// The provider that is not connected.
        provider: String,
    },

    /// The credential exists but is not `active`; the user must reconnect.
    #[error("credentials for {provider} are {status}, reconnect required")]
    CredentialInactive {
        /// The provider whose credential is unusable.
        provider: String,
        /// The stored status.
        status: String,
    },

    /// The stored credential has no refresh token to renew with.
    #[error("no refresh token stored for provider {provider}")]
    MissingRefreshToken {
        /// The provider lacking a refresh token.
        provider: String,
    },

    /// The provider name is not one LedgerLink integrates with.
    #[error("unknown provider: {name}")]
    UnknownProvider {
        /// The name that failed to parse.
        name: String,
    },

    /// The provider is known but no adapter was registered for it.
    #[error("provider not registered: {provider}")]
    ProviderNotRegistered {
        /// The provider without an adapter.
        provider: String,
    },

    /// `start()` was called on a refresh scheduler that is already running.
    #[error("token refresh scheduler is already running")]
    SchedulerAlreadyRunning,

    /// An HTTP request to the authorization server failed.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// An error propagated from the vault crate.
    #[error("vault error: {0}")]
    VaultError(#[from] VaultError),

    /// An error propagated from the storage crate.
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthEngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
