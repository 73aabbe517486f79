//! Keeping stored tokens valid.
//!
//! [`TokenRefresher`] is the single place a provider refresh happens. The
//! on-demand path ([`TokenRefresher::ensure_valid_token`]) and the background
//! sweep both go through it, and refreshes for one provider are serialized
//! behind a per-provider async mutex. The threshold is re-checked once the
//! mutex is held, so callers that queued behind a refresh reuse its result
//! instead of refreshing again.
//!
//! A refresh the provider rejects (`invalid_grant`) flips the credential to
//! `error`; it stays there until the user reconnects through a new OAuth
//! flow. Transient failures (5xx, rate limits, network) leave it `active` so
//! the caller may retry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ledgerlink_vault::{
    AuditAction, CredentialStatus, CredentialStore, IntegrationCredential, record_best_effort,
};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{AuthEngineError, Result};
use crate::flow::stored_tokens;
use crate::providers::{Provider, ProviderRegistry};

/// Refresh tokens that expire within this many seconds.
pub const DEFAULT_REFRESH_THRESHOLD_SECS: i64 = 30 * 60;

/// Background sweep period in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

/// Timing knobs for refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    /// Validity margin below which a token is refreshed.
    pub threshold: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: std::time::Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            threshold: Duration::seconds(DEFAULT_REFRESH_THRESHOLD_SECS),
            sweep_interval: std::time::Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Source of bearer tokens for outbound API calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A token that is valid for at least the refresh threshold.
    async fn ensure_valid_token(&self, provider: Provider) -> Result<String>;

    /// Refresh now, regardless of the stored expiry.
    async fn force_refresh(&self, provider: Provider) -> Result<String>;

    /// Record that the provider rejected our credentials.
    async fn mark_error(&self, provider: Provider, message: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TokenRefresher
// ---------------------------------------------------------------------------

/// Whether a read under the refresh lock records an access audit event.
#[derive(Debug, Clone, Copy)]
enum Read {
    Audited,
    Silent,
}

pub struct TokenRefresher {
    registry: Arc<ProviderRegistry>,
    credentials: CredentialStore,
    clock: Arc<dyn Clock>,
    threshold: Duration,
    locks: DashMap<Provider, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenRefresher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        credentials: CredentialStore,
        clock: Arc<dyn Clock>,
        threshold: Duration,
    ) -> Self {
        Self {
            registry,
            credentials,
            clock,
            threshold,
            locks: DashMap::new(),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Return a usable access token for `provider`, refreshing first if it
    /// expires within the threshold.
    ///
    /// Without a refresh token the stored access token is returned as long
    /// as it has not actually expired.
    #[instrument(skip(self))]
    pub async fn ensure_valid_token(&self, provider: Provider) -> Result<String> {
        let credential = self.active_credential(provider).await?;
        let now = self.clock.now();

        if !self.needs_refresh(credential.expires_at, now) {
            return access_token(provider, credential);
        }

        if credential.refresh_token.is_none() {
            if credential.expires_at.is_some_and(|e| e <= now) {
                return Err(AuthEngineError::TokenExpired {
                    provider: provider.to_string(),
                });
            }
            debug!(provider = %provider, "token near expiry but no refresh token stored");
            return access_token(provider, credential);
        }

        self.refresh_when_due(provider, Read::Silent).await
    }

    /// Refresh if the token is still inside the threshold once the
    /// provider's refresh lock is held; otherwise return the stored token.
    pub async fn refresh_if_due(&self, provider: Provider) -> Result<String> {
        self.refresh_when_due(provider, Read::Audited).await
    }

    /// Refresh unconditionally.
    #[instrument(skip(self))]
    pub async fn refresh_provider_tokens(&self, provider: Provider) -> Result<String> {
        let lock = self.lock_for(provider);
        let _guard = lock.lock().await;

        let credential = self.active_credential(provider).await?;
        self.refresh_locked(provider, credential).await
    }

    // -- internals ----------------------------------------------------------

    async fn refresh_when_due(&self, provider: Provider, read: Read) -> Result<String> {
        let lock = self.lock_for(provider);
        let _guard = lock.lock().await;

        let credential = match read {
            Read::Audited => self.active_credential(provider).await?,
            Read::Silent => self.reload_active(provider).await?,
        };
        if !self.needs_refresh(credential.expires_at, self.clock.now()) {
            debug!(provider = %provider, "token already refreshed by a concurrent caller");
            return access_token(provider, credential);
        }
        self.refresh_locked(provider, credential).await
    }

    fn needs_refresh(&self, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        expires_at.is_some_and(|e| e - now < self.threshold)
    }

    fn lock_for(&self, provider: Provider) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(provider).or_default().clone()
    }

    /// Read the credential, recording a `token_accessed` audit event.
    async fn active_credential(&self, provider: Provider) -> Result<IntegrationCredential> {
        let credential = self.credentials.get_credentials(provider.as_str()).await?;
        require_active(provider, credential)
    }

    /// Re-read under the refresh lock; the caller has already audited access.
    async fn reload_active(&self, provider: Provider) -> Result<IntegrationCredential> {
        let credential = self.credentials.load_credentials(provider.as_str()).await?;
        require_active(provider, credential)
    }

    /// Must be called with the provider's refresh lock held.
    async fn refresh_locked(
        &self,
        provider: Provider,
        credential: IntegrationCredential,
    ) -> Result<String> {
        let adapter = self.registry.get(provider)?;
        let refresh_token =
            credential
                .refresh_token
                .ok_or_else(|| AuthEngineError::MissingRefreshToken {
                    provider: provider.to_string(),
                })?;

        let tokens = match adapter.refresh_tokens(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                let message = e.to_string();
                if matches!(e, AuthEngineError::InvalidGrant { .. }) {
                    error!(provider = %provider, error = %e, "provider rejected token refresh");
                    if let Err(mark) = self
                        .credentials
                        .mark_error(provider.as_str(), &message)
                        .await
                    {
                        warn!(provider = %provider, error = %mark, "failed to record refresh error");
                    }
                } else {
                    warn!(provider = %provider, error = %e, "transient token refresh failure");
                }
                record_best_effort(
                    self.credentials.audit().as_ref(),
                    provider.as_str(),
                    AuditAction::TokenRefreshFailed,
                    Some(message.as_str()),
                )
                .await;
                return Err(e);
            }
        };

        self.credentials
            .store_credentials(provider.as_str(), &stored_tokens(&tokens))
            .await?;

        record_best_effort(
            self.credentials.audit().as_ref(),
            provider.as_str(),
            AuditAction::TokenRefreshed,
            None,
        )
        .await;

        info!(provider = %provider, expires_at = ?tokens.expires_at, "token refreshed");
        Ok(tokens.access_token)
    }
}

/// The credential is usable only while `active`.
fn require_active(
    provider: Provider,
    credential: Option<IntegrationCredential>,
) -> Result<IntegrationCredential> {
    let credential = credential.ok_or_else(|| AuthEngineError::CredentialNotFound {
        provider: provider.to_string(),
    })?;

    if credential.status != CredentialStatus::Active {
        return Err(AuthEngineError::CredentialInactive {
            provider: provider.to_string(),
            status: credential.status.to_string(),
        });
    }
    Ok(credential)
}

fn access_token(provider: Provider, credential: IntegrationCredential) -> Result<String> {
    credential
        .access_token
        .ok_or_else(|| AuthEngineError::TokenExpired {
            provider: provider.to_string(),
        })
}

#[async_trait]
impl TokenProvider for TokenRefresher {
    async fn ensure_valid_token(&self, provider: Provider) -> Result<String> {
        TokenRefresher::ensure_valid_token(self, provider).await
    }

    async fn force_refresh(&self, provider: Provider) -> Result<String> {
        self.refresh_provider_tokens(provider).await
    }

    async fn mark_error(&self, provider: Provider, message: &str) -> Result<()> {
        self.credentials
            .mark_error(provider.as_str(), message)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use ledgerlink_vault::StoredTokens;

    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{FakeAdapter, credential_store, credential_store_without_audit};

    struct Harness {
        refresher: Arc<TokenRefresher>,
        ramp: Arc<FakeAdapter>,
        credentials: CredentialStore,
        clock: Arc<ManualClock>,
    }

    async fn harness() -> Harness {
        let (credentials, _) = credential_store().await;
        harness_with(credentials)
    }

    fn harness_with(credentials: CredentialStore) -> Harness {
        let ramp = Arc::new(FakeAdapter::new(Provider::Ramp));
        let registry = Arc::new(ProviderRegistry::new().with(ramp.clone()));
        let clock = Arc::new(ManualClock::default());
        let refresher = Arc::new(TokenRefresher::new(
            registry,
            credentials.clone(),
            clock.clone(),
            Duration::minutes(30),
        ));
        Harness {
            refresher,
            ramp,
            credentials,
            clock,
        }
    }

    async fn store(h: &Harness, refresh: Option<&str>, expires_in: Duration) {
        h.credentials
            .store_credentials(
                "ramp",
                &StoredTokens {
                    access_token: "stored-access".into(),
                    refresh_token: refresh.map(Into::into),
                    expires_at: Some(h.clock.now() + expires_in),
                    metadata: serde_json::Map::new(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let h = harness().await;
        store(&h, Some("rt"), Duration::minutes(30)).await;

        let token = h.refresher.ensure_valid_token(Provider::Ramp).await.unwrap();
        assert_eq!(token, "stored-access");
        assert_eq!(h.ramp.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn token_inside_threshold_is_refreshed() {
        let h = harness().await;
        store(&h, Some("rt"), Duration::minutes(29)).await;

        let token = h.refresher.ensure_valid_token(Provider::Ramp).await.unwrap();
        assert_eq!(token, "ramp-access-r1");
        assert_eq!(h.ramp.refresh_calls.load(Ordering::SeqCst), 1);

        let stored = h.credentials.get_credentials("ramp").await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("ramp-access-r1"));
        assert_eq!(stored.refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn advancing_clock_triggers_refresh() {
        let h = harness().await;
        store(&h, Some("rt"), Duration::hours(2)).await;
        h.refresher.ensure_valid_token(Provider::Ramp).await.unwrap();
        assert_eq!(h.ramp.refresh_calls.load(Ordering::SeqCst), 0);

        h.clock.advance(Duration::minutes(95));
        h.refresher.ensure_valid_token(Provider::Ramp).await.unwrap();
        assert_eq!(h.ramp.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let h = harness().await;
        store(&h, Some("rt"), Duration::minutes(5)).await;
        h.ramp.slow_refresh(std::time::Duration::from_millis(50));

        let (a, b) = tokio::join!(
            h.refresher.ensure_valid_token(Provider::Ramp),
            h.refresher.ensure_valid_token(Provider::Ramp),
        );
        assert_eq!(a.unwrap(), "ramp-access-r1");
        assert_eq!(b.unwrap(), "ramp-access-r1");
        assert_eq!(h.ramp.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_marks_error() {
        let h = harness().await;
        store(&h, Some("rt"), Duration::minutes(5)).await;
        h.ramp.reject_refresh("invalid_grant");

        let err = h
            .refresher
            .ensure_valid_token(Provider::Ramp)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthEngineError::InvalidGrant { .. }));

        let stored = h.credentials.get_credentials("ramp").await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Error);
        assert!(stored.last_error.unwrap().contains("invalid_grant"));

        // No self-healing: further calls are rejected without hitting the provider.
        assert!(matches!(
            h.refresher.ensure_valid_token(Provider::Ramp).await,
            Err(AuthEngineError::CredentialInactive { .. })
        ));
        assert_eq!(h.ramp.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_uses_current_until_expiry() {
        let h = harness().await;
        store(&h, None, Duration::minutes(5)).await;
        assert_eq!(
            h.refresher.ensure_valid_token(Provider::Ramp).await.unwrap(),
            "stored-access"
        );

        h.clock.advance(Duration::minutes(6));
        assert!(matches!(
            h.refresher.ensure_valid_token(Provider::Ramp).await,
            Err(AuthEngineError::TokenExpired { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_provider_credentials_are_not_found() {
        let h = harness().await;
        assert!(matches!(
            h.refresher.ensure_valid_token(Provider::QuickBooks).await,
            Err(AuthEngineError::CredentialNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn force_refresh_ignores_threshold() {
        let h = harness().await;
        store(&h, Some("rt"), Duration::hours(3)).await;

        let token = TokenProvider::force_refresh(h.refresher.as_ref(), Provider::Ramp)
            .await
            .unwrap();
        assert_eq!(token, "ramp-access-r1");
    }

    #[tokio::test]
    async fn unavailable_token_endpoint_leaves_credential_active() {
        let h = harness().await;
        store(&h, Some("rt"), Duration::minutes(5)).await;
        h.ramp.refresh_unavailable(1);

        let err = h
            .refresher
            .ensure_valid_token(Provider::Ramp)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthEngineError::TokenEndpoint { status: 503, .. }
        ));

        let stored = h.credentials.get_credentials("ramp").await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Active);
        assert!(stored.last_error.is_none());

        // The provider recovered; the next call refreshes normally.
        let token = h.refresher.ensure_valid_token(Provider::Ramp).await.unwrap();
        assert_eq!(token, "ramp-access-r2");
        assert_eq!(h.ramp.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn on_demand_refresh_records_one_access() {
        let (credentials, audit) = credential_store().await;
        let h = harness_with(credentials);
        store(&h, Some("rt"), Duration::minutes(5)).await;

        h.refresher.ensure_valid_token(Provider::Ramp).await.unwrap();

        let entries = audit.query_recent(Some("ramp"), 10).await.unwrap();
        let accessed = entries
            .iter()
            .filter(|e| e.action == AuditAction::TokenAccessed)
            .count();
        assert_eq!(accessed, 1);
        assert!(
            entries
                .iter()
                .any(|e| e.action == AuditAction::TokenRefreshed)
        );
    }

    #[tokio::test]
    async fn refresh_succeeds_when_audit_log_is_down() {
        let h = harness_with(credential_store_without_audit().await);
        store(&h, Some("rt"), Duration::minutes(5)).await;

        assert_eq!(
            h.refresher.ensure_valid_token(Provider::Ramp).await.unwrap(),
            "ramp-access-r1"
        );
        assert_eq!(
            h.refresher
                .refresh_provider_tokens(Provider::Ramp)
                .await
                .unwrap(),
            "ramp-access-r2"
        );
        let stored = h.credentials.get_credentials("ramp").await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("ramp-access-r2"));
    }
}
