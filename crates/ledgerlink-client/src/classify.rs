//! Mapping raw failures onto a small, fixed taxonomy.
//!
//! | Failure                              | Category        | Retryable |
//! |--------------------------------------|-----------------|-----------|
//! | HTTP 401 / 403, unusable credentials | `auth_expired`  | no (one refresh-then-retry) |
//! | HTTP 429                             | `rate_limited`  | yes |
//! | HTTP 5xx                             | `server_error`  | yes |
//! | other HTTP 4xx                       | `client_error`  | no  |
//! | connect, DNS, timeout                | `network`       | yes |
//! | anything else                        | `unknown`       | no  |

use ledgerlink_auth_engine::{AuthEngineError, Provider, TokenProvider};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimited,
    AuthExpired,
    ServerError,
    ClientError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::AuthExpired => "auth_expired",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure with its category and retry verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub message: String,
    pub status_code: Option<u16>,
    /// Whether the generic backoff loop may try again.
    pub retryable: bool,
}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let retryable = matches!(
            category,
            ErrorCategory::Network | ErrorCategory::RateLimited | ErrorCategory::ServerError
        );
        Self {
            category,
            message: message.into(),
            status_code: None,
            retryable,
        }
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let category = match status {
            401 | 403 => ErrorCategory::AuthExpired,
            429 => ErrorCategory::RateLimited,
            500..=599 => ErrorCategory::ServerError,
            400..=499 => ErrorCategory::ClientError,
            _ => ErrorCategory::Unknown,
        };
        Self {
            status_code: Some(status),
            ..Self::new(category, message)
        }
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{} (HTTP {status}): {}", self.category, self.message),
            None => write!(f, "{}: {}", self.category, self.message),
        }
    }
}

/// Errors that know their own category.
pub trait Classify {
    fn classify(&self) -> ClassifiedError;
}

/// Classify any supported error.
pub fn classify_error<E: Classify + ?Sized>(error: &E) -> ClassifiedError {
    error.classify()
}

impl Classify for ClassifiedError {
    fn classify(&self) -> ClassifiedError {
        self.clone()
    }
}

impl Classify for reqwest::Error {
    fn classify(&self) -> ClassifiedError {
        if let Some(status) = self.status() {
            return ClassifiedError::from_status(status.as_u16(), self.to_string());
        }
        if self.is_timeout() || self.is_connect() || self.is_request() {
            return ClassifiedError::new(ErrorCategory::Network, self.to_string());
        }
        ClassifiedError::new(ErrorCategory::Unknown, self.to_string())
    }
}

impl Classify for AuthEngineError {
    fn classify(&self) -> ClassifiedError {
        match self {
            Self::NetworkError(e) => e.classify(),
            Self::TokenEndpoint { status, .. } => {
                ClassifiedError::from_status(*status, self.to_string())
            }
            Self::InvalidGrant { .. }
            | Self::TokenExpired { .. }
            | Self::CredentialNotFound { .. }
            | Self::CredentialInactive { .. }
            | Self::MissingRefreshToken { .. }
            | Self::InvalidState => {
                ClassifiedError::new(ErrorCategory::AuthExpired, self.to_string())
            }
            _ => ClassifiedError::new(ErrorCategory::Unknown, self.to_string()),
        }
    }
}

impl Classify for ClientError {
    fn classify(&self) -> ClassifiedError {
        match self {
            Self::Http { status, body } => ClassifiedError::from_status(*status, body.clone()),
            Self::Network(e) => e.classify(),
            Self::Auth(e) => e.classify(),
            Self::Api(classified) => classified.clone(),
            Self::InvalidRequest(_) => {
                ClassifiedError::new(ErrorCategory::Unknown, self.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal failure handling
// ---------------------------------------------------------------------------

/// What the caller should do after a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Tokens were refreshed; try exactly once more.
    RetryOnce,
    /// Give up and report the error.
    Surface,
}

/// React to a failure that the retry loop gave up on.
///
/// An `auth_expired` failure triggers one forced token refresh; when that
/// succeeds the caller gets one more attempt.
pub async fn handle_integration_error(
    error: &ClassifiedError,
    provider: Provider,
    tokens: &dyn TokenProvider,
    context: &str,
) -> ErrorAction {
    if error.category != ErrorCategory::AuthExpired {
        error!(
            provider = %provider,
            context = context,
            category = %error.category,
            status = ?error.status_code,
            "integration call failed"
        );
        return ErrorAction::Surface;
    }

    warn!(provider = %provider, context = context, "credentials rejected, forcing token refresh");
    match tokens.force_refresh(provider).await {
        Ok(_) => {
            info!(provider = %provider, context = context, "token refreshed, retrying once");
            ErrorAction::RetryOnce
        }
        Err(e) => {
            error!(
                provider = %provider,
                context = context,
                error = %e,
                "token refresh after auth failure did not succeed"
            );
            ErrorAction::Surface
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[test]
    fn status_decision_table() {
        let cases = [
            (401, ErrorCategory::AuthExpired, false),
            (403, ErrorCategory::AuthExpired, false),
            (429, ErrorCategory::RateLimited, true),
            (500, ErrorCategory::ServerError, true),
            (503, ErrorCategory::ServerError, true),
            (400, ErrorCategory::ClientError, false),
            (404, ErrorCategory::ClientError, false),
            (422, ErrorCategory::ClientError, false),
            (302, ErrorCategory::Unknown, false),
        ];
        for (status, category, retryable) in cases {
            let c = ClassifiedError::from_status(status, "x");
            assert_eq!(c.category, category, "status {status}");
            assert_eq!(c.retryable, retryable, "status {status}");
            assert_eq!(c.status_code, Some(status));
        }
    }

    #[test]
    fn auth_engine_errors() {
        let endpoint = AuthEngineError::TokenEndpoint {
            status: 502,
            reason: "bad gateway".into(),
        };
        assert_eq!(endpoint.classify().category, ErrorCategory::ServerError);
        assert!(endpoint.classify().retryable);

        let inactive = AuthEngineError::CredentialInactive {
            provider: "ramp".into(),
            status: "error".into(),
        };
        assert_eq!(inactive.classify().category, ErrorCategory::AuthExpired);
        assert!(!inactive.classify().retryable);

        let busy = AuthEngineError::SchedulerAlreadyRunning;
        assert_eq!(classify_error(&busy).category, ErrorCategory::Unknown);
    }

    #[test]
    fn client_errors() {
        let http = ClientError::Http {
            status: 429,
            body: "slow down".into(),
        };
        let c = http.classify();
        assert_eq!(c.category, ErrorCategory::RateLimited);
        assert_eq!(c.message, "slow down");

        let invalid = ClientError::InvalidRequest("no base url".into());
        assert!(!invalid.classify().retryable);
    }

    #[tokio::test]
    async fn connection_refused_is_network() {
        // Port 9 (discard) is closed on test hosts.
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:9/")
            .send()
            .await
            .unwrap_err();
        let c = err.classify();
        assert_eq!(c.category, ErrorCategory::Network);
        assert!(c.retryable);
    }

    struct CountingTokens {
        refreshes: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        async fn ensure_valid_token(&self, _: Provider) -> ledgerlink_auth_engine::Result<String> {
            Ok("t".into())
        }

        async fn force_refresh(&self, provider: Provider) -> ledgerlink_auth_engine::Result<String> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AuthEngineError::InvalidGrant {
                    reason: format!("{provider} revoked"),
                });
            }
            Ok("t2".into())
        }

        async fn mark_error(&self, _: Provider, _: &str) -> ledgerlink_auth_engine::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn auth_expired_triggers_refresh() {
        let tokens = CountingTokens {
            refreshes: AtomicUsize::new(0),
            fail: false,
        };
        let action = handle_integration_error(
            &ClassifiedError::from_status(401, "unauthorized"),
            Provider::Ramp,
            &tokens,
            "GET /bills",
        )
        .await;
        assert_eq!(action, ErrorAction::RetryOnce);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_surfaces() {
        let tokens = CountingTokens {
            refreshes: AtomicUsize::new(0),
            fail: true,
        };
        let action = handle_integration_error(
            &ClassifiedError::from_status(403, "forbidden"),
            Provider::Ramp,
            &tokens,
            "GET /bills",
        )
        .await;
        assert_eq!(action, ErrorAction::Surface);
    }

    #[tokio::test]
    async fn other_categories_do_not_refresh() {
        let tokens = CountingTokens {
            refreshes: AtomicUsize::new(0),
            fail: false,
        };
        for status in [404, 429, 500] {
            let action = handle_integration_error(
                &ClassifiedError::from_status(status, "x"),
                Provider::QuickBooks,
                &tokens,
                "ctx",
            )
            .await;
            assert_eq!(action, ErrorAction::Surface);
        }
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 0);
    }
}
