//! Standard OAuth 2.0 authorization-code client.
//!
//! Both supported providers speak plain RFC 6749; they differ only in
//! endpoint URLs, scopes, how client credentials are sent and which callback
//! parameters matter. Those differences are data ([`ProviderDescriptor`]),
//! and one adapter ([`StandardOAuthAdapter`]) drives them all.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Provider, ProviderAdapter, ProviderCredentials, TokenSet};
use crate::error::{AuthEngineError, Result};

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// How the client id/secret travel to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthStyle {
    /// `Authorization: Basic base64(client_id:client_secret)`.
    BasicHeader,
    /// `client_id` and `client_secret` form fields.
    RequestBody,
}

/// Body encoding expected by the revocation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeEncoding {
    /// `token=...` form body (RFC 7009).
    Form,
    /// `{"token": "..."}` JSON body.
    Json,
}

/// Endpoints and conventions of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub provider: Provider,
    pub authorize_url: String,
    pub token_url: String,
    pub revoke_url: String,
    /// Base URL for business API calls made with the access token.
    pub api_base_url: String,
    pub scopes: Vec<String>,
    pub auth_style: ClientAuthStyle,
    pub revoke_encoding: RevokeEncoding,
    /// Callback query parameters copied into [`TokenSet::extras`].
    pub callback_extras: Vec<String>,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Raw token response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

impl TokenResponse {
    /// Convert into a [`TokenSet`], computing `expires_at` from `expires_in`.
    fn into_tokens(self) -> TokenSet {
        let expires_at = self
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        let scopes = self
            .scope
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scopes,
            extras: serde_json::Map::new(),
        }
    }
}

/// Raw error response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// A [`ProviderAdapter`] driven entirely by a [`ProviderDescriptor`].
pub struct StandardOAuthAdapter {
    descriptor: ProviderDescriptor,
    credentials: ProviderCredentials,
    client: reqwest::Client,
}

impl StandardOAuthAdapter {
    pub fn new(descriptor: ProviderDescriptor, credentials: ProviderCredentials) -> Self {
        Self::with_client(descriptor, credentials, reqwest::Client::new())
    }

    /// Use a preconfigured HTTP client (timeouts, proxies).
    pub fn with_client(
        descriptor: ProviderDescriptor,
        credentials: ProviderCredentials,
        client: reqwest::Client,
    ) -> Self {
        Self {
            descriptor,
            credentials,
            client,
        }
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    /// POST a form to `url` with client credentials attached per the
    /// descriptor's auth style.
    fn authenticated_post(
        &self,
        url: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> reqwest::RequestBuilder {
        let request = self.client.post(url).header("Accept", "application/json");
        match self.descriptor.auth_style {
            ClientAuthStyle::BasicHeader => request
                .basic_auth(
                    &self.credentials.client_id,
                    Some(&self.credentials.client_secret),
                )
                .form(&params),
            ClientAuthStyle::RequestBody => {
                params.push(("client_id", self.credentials.client_id.clone()));
                params.push(("client_secret", self.credentials.client_secret.clone()));
                request.form(&params)
            }
        }
    }

    /// Parse the HTTP response from the token endpoint.
    ///
    /// Client errors (4xx other than 429) mean the provider rejected the
    /// grant; anything else non-successful is reported with its status.
    async fn parse_token_response(response: reqwest::Response) -> Result<TokenSet> {
        let status = response.status();

        if status.is_success() {
            let token_response: TokenResponse = response.json().await?;
            tracing::debug!("token exchange successful");
            return Ok(token_response.into_tokens());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(err) => match err.error_description {
                Some(description) => format!("{}: {description}", err.error),
                None => err.error,
            },
            Err(_) => body,
        };

        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(AuthEngineError::InvalidGrant { reason })
        } else {
            Err(AuthEngineError::TokenEndpoint {
                status: status.as_u16(),
                reason,
            })
        }
    }
}

#[async_trait]
impl ProviderAdapter for StandardOAuthAdapter {
    fn provider(&self) -> Provider {
        self.descriptor.provider
    }

    fn api_base_url(&self) -> &str {
        &self.descriptor.api_base_url
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.descriptor.authorize_url)?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.credentials.client_id);
            params.append_pair("response_type", "code");
            if !self.descriptor.scopes.is_empty() {
                params.append_pair("scope", &self.descriptor.scopes.join(" "));
            }
            params.append_pair("redirect_uri", &self.credentials.redirect_uri);
            params.append_pair("state", state);
        }

        Ok(url.to_string())
    }

    async fn exchange_code_for_tokens(
        &self,
        code: &str,
        callback_params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<TokenSet> {
        let params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.credentials.redirect_uri.clone()),
        ];

        tracing::debug!(
            provider = %self.descriptor.provider,
            token_url = %self.descriptor.token_url,
            "exchanging authorization code"
        );

        let response = self
            .authenticated_post(&self.descriptor.token_url, params)
            .send()
            .await?;
        let mut tokens = Self::parse_token_response(response).await?;

        for key in &self.descriptor.callback_extras {
            if let Some(value) = callback_params.get(key) {
                tokens.extras.insert(key.clone(), value.clone());
            }
        }

        Ok(tokens)
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenSet> {
        let params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];

        tracing::debug!(
            provider = %self.descriptor.provider,
            token_url = %self.descriptor.token_url,
            "refreshing access token"
        );

        let response = self
            .authenticated_post(&self.descriptor.token_url, params)
            .send()
            .await?;
        let mut tokens = Self::parse_token_response(response).await?;

        if tokens.refresh_token.is_none() {
            tracing::debug!(
                provider = %self.descriptor.provider,
                "provider did not rotate the refresh token, keeping the previous one"
            );
            tokens.refresh_token = Some(refresh_token.to_string());
        }

        Ok(tokens)
    }

    async fn revoke_tokens(&self, token: &str) -> Result<()> {
        let request = match self.descriptor.revoke_encoding {
            RevokeEncoding::Form => self.authenticated_post(
                &self.descriptor.revoke_url,
                vec![("token", token.to_string())],
            ),
            RevokeEncoding::Json => self
                .client
                .post(&self.descriptor.revoke_url)
                .header("Accept", "application/json")
                .basic_auth(
                    &self.credentials.client_id,
                    Some(&self.credentials.client_secret),
                )
                .json(&serde_json::json!({ "token": token })),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthEngineError::TokenEndpoint {
                status: status.as_u16(),
                reason: body,
            });
        }

        tracing::debug!(provider = %self.descriptor.provider, "token revoked");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
