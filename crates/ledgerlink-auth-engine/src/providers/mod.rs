//! Provider adapters.
//!
//! Every external provider implements [`ProviderAdapter`], the four-operation
//! OAuth2 client contract. Providers form a closed set ([`Provider`]) and are
//! looked up through a [`ProviderRegistry`]; asking for a provider without a
//! registered adapter is an error, never a fallback.

pub mod quickbooks;
pub mod ramp;
pub mod standard;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthEngineError, Result};

pub use standard::{ClientAuthStyle, ProviderDescriptor, RevokeEncoding, StandardOAuthAdapter};

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// The providers LedgerLink integrates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Intuit QuickBooks Online (accounting).
    QuickBooks,
    /// Ramp (expense management).
    Ramp,
}

impl Provider {
    /// Every supported provider.
    pub const ALL: [Provider; 2] = [Provider::QuickBooks, Provider::Ramp];

    /// The key used in storage and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuickBooks => "quickbooks",
            Self::Ramp => "ramp",
        }
    }

    /// Parse a storage/configuration key.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quickbooks" => Some(Self::QuickBooks),
            "ramp" => Some(Self::Ramp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = AuthEngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| AuthEngineError::UnknownProvider { name: s.to_string() })
    }
}

// ---------------------------------------------------------------------------
// Token types
// ---------------------------------------------------------------------------

/// Tokens returned by a provider after a code exchange or refresh.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSet {
    /// The access token used to authenticate API requests.
    pub access_token: String,

    /// The refresh token used to obtain new access tokens.
    pub refresh_token: Option<String>,

    /// When the access token expires.
    pub expires_at: Option<DateTime<Utc>>,

    /// The token type (typically "Bearer").
    pub token_type: String,

    /// The scopes that were granted.
    pub scopes: Vec<String>,

    /// Provider-specific values (e.g. the QuickBooks `realmId`).
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .field("extras", &self.extras)
            .finish()
    }
}

/// OAuth client registration for one provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// The OAuth2 client operations every provider supports.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this adapter talks to.
    fn provider(&self) -> Provider;

    /// Base URL for the provider's business API.
    fn api_base_url(&self) -> &str;

    /// Build the URL the user visits to grant access, embedding `state`.
    fn authorization_url(&self, state: &str) -> Result<String>;

    /// Exchange an authorization code for tokens.
    ///
    /// `callback_params` holds the extra query parameters the provider sent
    /// with the redirect; the ones the provider cares about end up in
    /// [`TokenSet::extras`].
    async fn exchange_code_for_tokens(
        &self,
        code: &str,
        callback_params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<TokenSet>;

    /// Obtain a new access token. A response without a refresh token keeps
    /// `refresh_token`.
    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenSet>;

    /// Revoke a token on the provider side.
    async fn revoke_tokens(&self, token: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lookup table from [`Provider`] to its adapter.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the adapter for its provider.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        tracing::debug!(provider = %adapter.provider(), "registered provider adapter");
        self.adapters.insert(adapter.provider(), adapter);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// The adapter for `provider`.
    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| AuthEngineError::ProviderNotRegistered {
                provider: provider.to_string(),
            })
    }

    /// Providers with a registered adapter.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.adapters.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
