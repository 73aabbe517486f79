//! The OAuth connect flow.
//!
//! ```text
//! initiate ──▶ state issued ──callback──▶ state consumed ──▶ code exchange ──▶ credentials stored
//!                   │
//!                   └── TTL elapses ──▶ expired (removed on next lookup)
//! ```
//!
//! A state token verifies at most once and only for the provider it was
//! issued for.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ledgerlink_vault::{
    AuditAction, CredentialStore, StoredTokens, generate_state_token, record_best_effort,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::error::{AuthEngineError, Result};
use crate::providers::{Provider, ProviderRegistry, TokenSet};
use crate::state::{OAuthState, StateStore};

/// How long an issued state stays valid.
pub const DEFAULT_STATE_TTL_SECS: i64 = 600;

/// What the user is sent to, and the state that must come back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub auth_url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

/// Drives authorization-code grants for every registered provider.
pub struct OAuthFlowManager {
    registry: Arc<ProviderRegistry>,
    states: Arc<dyn StateStore>,
    credentials: CredentialStore,
    clock: Arc<dyn Clock>,
    state_ttl: Duration,
}

impl OAuthFlowManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        states: Arc<dyn StateStore>,
        credentials: CredentialStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            states,
            credentials,
            clock,
            state_ttl: Duration::seconds(DEFAULT_STATE_TTL_SECS),
        }
    }

    /// Override the state TTL.
    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// Issue a state and build the authorization URL for `provider`.
    #[instrument(skip(self))]
    pub async fn initiate(&self, provider: Provider) -> Result<AuthorizationRequest> {
        let adapter = self.registry.get(provider)?;
        let state_token = generate_state_token()?;
        let now = self.clock.now();
        let expires_at = now + self.state_ttl;

        let auth_url = adapter.authorization_url(&state_token)?;
        self.states
            .insert(OAuthState {
                provider,
                state_token: state_token.clone(),
                created_at: now,
                expires_at,
            })
            .await?;

        info!(provider = %provider, expires_at = %expires_at, "oauth flow initiated");
        Ok(AuthorizationRequest {
            auth_url,
            state: state_token,
            expires_at,
        })
    }

    /// Consume `state`. Returns `None` if it is unknown, already used or
    /// expired; the state is gone afterwards in every case.
    pub async fn verify_state(&self, state: &str) -> Result<Option<OAuthState>> {
        let Some(stored) = self.states.take(state).await? else {
            return Ok(None);
        };
        if stored.is_expired(self.clock.now()) {
            info!(provider = %stored.provider, "oauth state expired");
            return Ok(None);
        }
        Ok(Some(stored))
    }

    /// Finish a flow: verify the state, exchange the code, store the tokens.
    ///
    /// `callback_params` are the remaining query parameters from the
    /// redirect; provider-specific ones (such as the QuickBooks `realmId`)
    /// are kept in the credential metadata.
    #[instrument(skip(self, code, state, callback_params))]
    pub async fn handle_callback(
        &self,
        provider: Provider,
        code: &str,
        state: &str,
        callback_params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<TokenSet> {
        let verified = self.verify_state(state).await?;
        match verified {
            Some(s) if s.provider == provider => {}
            Some(s) => {
                warn!(
                    provider = %provider,
                    issued_for = %s.provider,
                    "oauth callback state was issued for another provider"
                );
                return Err(AuthEngineError::InvalidState);
            }
            None => return Err(AuthEngineError::InvalidState),
        }

        let adapter = self.registry.get(provider)?;
        let tokens = adapter.exchange_code_for_tokens(code, callback_params).await?;

        self.credentials
            .store_credentials(provider.as_str(), &stored_tokens(&tokens))
            .await?;

        record_best_effort(
            self.credentials.audit().as_ref(),
            provider.as_str(),
            AuditAction::TokenCreated,
            None,
        )
        .await;

        info!(provider = %provider, "oauth flow completed");
        Ok(tokens)
    }

    /// Revoke on the provider side if possible, then clear the stored tokens.
    ///
    /// A revocation failure is logged and does not stop the local disconnect.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, provider: Provider) -> Result<()> {
        let credential = self
            .credentials
            .get_credentials(provider.as_str())
            .await?
            .ok_or_else(|| AuthEngineError::CredentialNotFound {
                provider: provider.to_string(),
            })?;

        let token = credential.access_token.or(credential.refresh_token);
        if let Some(token) = token {
            match self.registry.get(provider) {
                Ok(adapter) => {
                    if let Err(e) = adapter.revoke_tokens(&token).await {
                        warn!(provider = %provider, error = %e, "token revocation failed");
                    }
                }
                Err(e) => warn!(provider = %provider, error = %e, "skipping token revocation"),
            }
        }

        self.credentials.mark_disconnected(provider.as_str()).await?;

        record_best_effort(
            self.credentials.audit().as_ref(),
            provider.as_str(),
            AuditAction::IntegrationDisconnected,
            None,
        )
        .await;

        info!(provider = %provider, "integration disconnected");
        Ok(())
    }
}

/// Map a provider token set onto what the credential store persists.
///
/// Extras, the token type and granted scopes go into the metadata map.
pub(crate) fn stored_tokens(tokens: &TokenSet) -> StoredTokens {
    let mut metadata = tokens.extras.clone();
    metadata.insert(
        "token_type".to_string(),
        serde_json::Value::String(tokens.token_type.clone()),
    );
    if !tokens.scopes.is_empty() {
        metadata.insert("scopes".to_string(), serde_json::json!(tokens.scopes));
    }

    StoredTokens {
        access_token: tokens.access_token.clone(),
        refresh_token: tokens.refresh_token.clone(),
        expires_at: tokens.expires_at,
        metadata,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
