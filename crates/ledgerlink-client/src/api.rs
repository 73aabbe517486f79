//! Per-provider HTTP client.
//!
//! Every request gets a request id, a fresh bearer token on each attempt,
//! and runs under the provider's [`RetryConfig`]. When the retry loop gives
//! up on an `auth_expired` failure the token is force-refreshed and the
//! request is tried exactly once more; if that still fails with
//! `auth_expired` the credential is marked as errored.

use std::sync::Arc;
use std::time::Duration;

use ledgerlink_auth_engine::{Provider, ProviderAdapter, TokenProvider};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classify::{
    ClassifiedError, Classify, ErrorAction, ErrorCategory, handle_integration_error,
};
use crate::error::{ClientError, Result};
use crate::retry::{RetryConfig, with_retry};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How to reach one provider's API.
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub provider: Provider,
    /// Relative endpoints are joined onto this.
    pub base_url: String,
    pub retry: RetryConfig,
    pub timeout: Duration,
}

impl ApiClientConfig {
    pub fn new(provider: Provider, base_url: impl Into<String>) -> Self {
        Self {
            provider,
            base_url: base_url.into(),
            retry: RetryConfig::for_provider(provider),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Use the adapter's API base URL.
    pub fn for_adapter(adapter: &dyn ProviderAdapter) -> Self {
        Self::new(adapter.provider(), adapter.api_base_url())
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-request options for [`ApiClient::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<serde_json::Value>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            query: Vec::new(),
            headers: Vec::new(),
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Error half of an [`ApiResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub category: ErrorCategory,
    pub message: String,
    pub status_code: Option<u16>,
}

impl From<ClassifiedError> for ApiError {
    fn from(e: ClassifiedError) -> Self {
        Self {
            category: e.category,
            message: e.message,
            status_code: e.status_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub attempts: u32,
    pub total_delay_ms: u64,
    pub request_id: String,
}

/// Result of one logical API call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<ApiError>,
    pub meta: ResponseMeta,
}

impl ApiResponse {
    /// Deserialize the payload, or surface the classified failure.
    pub fn into_data<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        if let Some(error) = self.error {
            return Err(ClientError::Api(ClassifiedError {
                retryable: false,
                category: error.category,
                message: error.message,
                status_code: error.status_code,
            }));
        }
        let data = self.data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data)
            .map_err(|e| ClientError::InvalidRequest(format!("unexpected response shape: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client bound to one provider.
#[derive(Clone)]
pub struct ApiClient {
    config: ApiClientConfig,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

/// Build an [`ApiClient`] for `config`, drawing tokens from `tokens`.
pub fn create_api_client(
    config: ApiClientConfig,
    tokens: Arc<dyn TokenProvider>,
) -> Result<ApiClient> {
    if config.base_url.is_empty() {
        return Err(ClientError::InvalidRequest(
            "api base url must not be empty".to_string(),
        ));
    }
    let http = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()?;
    Ok(ApiClient {
        config,
        http,
        tokens,
    })
}

impl ApiClient {
    pub fn provider(&self) -> Provider {
        self.config.provider
    }

    pub async fn get(&self, endpoint: &str) -> ApiResponse {
        self.request(endpoint, RequestOptions::new(Method::GET)).await
    }

    pub async fn post(&self, endpoint: &str, body: serde_json::Value) -> ApiResponse {
        self.request(endpoint, RequestOptions::new(Method::POST).json(body))
            .await
    }

    pub async fn put(&self, endpoint: &str, body: serde_json::Value) -> ApiResponse {
        self.request(endpoint, RequestOptions::new(Method::PUT).json(body))
            .await
    }

    pub async fn patch(&self, endpoint: &str, body: serde_json::Value) -> ApiResponse {
        self.request(endpoint, RequestOptions::new(Method::PATCH).json(body))
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> ApiResponse {
        self.request(endpoint, RequestOptions::new(Method::DELETE))
            .await
    }

    /// Issue one logical request with retries.
    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> ApiResponse {
        let provider = self.config.provider;
        let request_id = Uuid::now_v7().to_string();
        let url = self.url_for(endpoint);
        let context = format!("{} {endpoint}", options.method);

        info!(
            provider = %provider,
            request_id = %request_id,
            method = %options.method,
            endpoint = endpoint,
            "api request started"
        );

        let outcome = with_retry(
            || self.send_once(&url, &options),
            &self.config.retry,
            &context,
        )
        .await;

        let mut attempts = outcome.attempts;
        let total_delay_ms = outcome.total_delay_ms;
        let mut result = outcome.into_result();

        let retry_once = match &result {
            Err(classified) => {
                handle_integration_error(classified, provider, self.tokens.as_ref(), &context)
                    .await
                    == ErrorAction::RetryOnce
            }
            Ok(_) => false,
        };

        if retry_once {
            attempts += 1;
            result = self
                .send_once(&url, &options)
                .await
                .map_err(|e| e.classify());

            if let Err(classified) = &result
                && classified.category == ErrorCategory::AuthExpired
            {
                if let Err(e) = self.tokens.mark_error(provider, &classified.message).await {
                    warn!(provider = %provider, error = %e, "failed to mark credential as errored");
                }
            }
        }

        let meta = ResponseMeta {
            attempts,
            total_delay_ms,
            request_id,
        };

        match result {
            Ok(data) => {
                info!(
                    provider = %provider,
                    request_id = %meta.request_id,
                    attempts,
                    "api request succeeded"
                );
                ApiResponse {
                    success: true,
                    data: Some(data),
                    error: None,
                    meta,
                }
            }
            Err(classified) => {
                error!(
                    provider = %provider,
                    request_id = %meta.request_id,
                    attempts,
                    category = %classified.category,
                    status = ?classified.status_code,
                    "api request failed"
                );
                ApiResponse {
                    success: false,
                    data: None,
                    error: Some(classified.into()),
                    meta,
                }
            }
        }
    }

    // -- internals ----------------------------------------------------------

    fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    /// One HTTP attempt with a freshly validated token.
    async fn send_once(&self, url: &str, options: &RequestOptions) -> Result<serde_json::Value> {
        let token = self
            .tokens
            .ensure_valid_token(self.config.provider)
            .await?;

        let mut request = self
            .http
            .request(options.method.clone(), url)
            .bearer_auth(token)
            .header("Accept", "application/json");
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
