//! Configuration for the `ledgerlink` binary.
//!
//! Tunables come from `config/ledgerlink.toml` (every key optional), then
//! environment variables override them. Secrets are read from the
//! environment only and never appear in the file format.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use ledgerlink_auth_engine::providers::quickbooks::{self, QuickBooksEnvironment};
use ledgerlink_auth_engine::providers::ramp;
use ledgerlink_auth_engine::refresh::{DEFAULT_REFRESH_THRESHOLD_SECS, DEFAULT_SWEEP_INTERVAL_SECS};
use ledgerlink_auth_engine::{
    Provider, ProviderCredentials, ProviderDescriptor, ProviderRegistry, RefreshSettings,
    StandardOAuthAdapter,
};
use ledgerlink_client::RetryConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Used when `--config` is not given. A missing file here is not an error.
pub const DEFAULT_CONFIG_PATH: &str = "config/ledgerlink.toml";

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub refresh: RefreshConfig,
    pub oauth: OAuthConfig,
    pub quickbooks: QuickBooksConfig,
    pub ramp: ProviderConfig,
    /// Filled from the environment by [`Config::apply_env`].
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/ledgerlink.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub sweep_interval_secs: u64,
    /// Tokens expiring within this margin are refreshed.
    pub threshold_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            threshold_secs: DEFAULT_REFRESH_THRESHOLD_SECS.unsigned_abs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub state_ttl_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: ledgerlink_auth_engine::flow::DEFAULT_STATE_TTL_SECS.unsigned_abs(),
        }
    }
}

/// Per-provider settings. Endpoint fields replace the built-in URLs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub redirect_uri: Option<String>,
    pub authorize_url: Option<String>,
    pub token_url: Option<String>,
    pub revoke_url: Option<String>,
    pub api_base_url: Option<String>,
    /// Falls back to the provider's default policy.
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickBooksConfig {
    pub environment: QuickBooksEnvironment,
    #[serde(flatten)]
    pub provider: ProviderConfig,
}

/// Values that only ever come from the environment.
#[derive(Clone, Default)]
pub struct Secrets {
    pub app_secret: Option<String>,
    pub quickbooks_client_id: Option<String>,
    pub quickbooks_client_secret: Option<String>,
    pub ramp_client_id: Option<String>,
    pub ramp_client_secret: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("has_app_secret", &self.app_secret.is_some())
            .field("quickbooks_client_id", &self.quickbooks_client_id)
            .field("has_quickbooks_client_secret", &self.quickbooks_client_secret.is_some())
            .field("ramp_client_id", &self.ramp_client_id)
            .field("has_ramp_client_secret", &self.ramp_client_secret.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load `path` (or the default location) and apply the process
    /// environment. An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    info!(path = DEFAULT_CONFIG_PATH, "no configuration file, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay environment variables read through `lookup`. Empty values
    /// count as unset.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = var("LEDGERLINK_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(uri) = var("QUICKBOOKS_REDIRECT_URI") {
            self.quickbooks.provider.redirect_uri = Some(uri);
        }
        if let Some(uri) = var("RAMP_REDIRECT_URI") {
            self.ramp.redirect_uri = Some(uri);
        }
        if let Some(env) = var("QUICKBOOKS_ENVIRONMENT") {
            match env.trim().to_ascii_lowercase().as_str() {
                "sandbox" => self.quickbooks.environment = QuickBooksEnvironment::Sandbox,
                "production" => self.quickbooks.environment = QuickBooksEnvironment::Production,
                other => warn!(value = other, "ignoring unknown QUICKBOOKS_ENVIRONMENT"),
            }
        }

        self.secrets = Secrets {
            app_secret: var("LEDGERLINK_APP_SECRET"),
            quickbooks_client_id: var("QUICKBOOKS_CLIENT_ID"),
            quickbooks_client_secret: var("QUICKBOOKS_CLIENT_SECRET"),
            ramp_client_id: var("RAMP_CLIENT_ID"),
            ramp_client_secret: var("RAMP_CLIENT_SECRET"),
        };
    }
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn app_secret(&self) -> Result<&str> {
        match self.secrets.app_secret.as_deref() {
            Some(secret) => Ok(secret),
            None => bail!("LEDGERLINK_APP_SECRET is not set"),
        }
    }

    fn provider_config(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::QuickBooks => &self.quickbooks.provider,
            Provider::Ramp => &self.ramp,
        }
    }

    /// Client registration for `provider`, if all three parts are set.
    pub fn provider_credentials(&self, provider: Provider) -> Option<ProviderCredentials> {
        let (client_id, client_secret) = match provider {
            Provider::QuickBooks => (
                &self.secrets.quickbooks_client_id,
                &self.secrets.quickbooks_client_secret,
            ),
            Provider::Ramp => (&self.secrets.ramp_client_id, &self.secrets.ramp_client_secret),
        };
        Some(ProviderCredentials {
            client_id: client_id.clone()?,
            client_secret: client_secret.clone()?,
            redirect_uri: self.provider_config(provider).redirect_uri.clone()?,
        })
    }

    /// Built-in endpoints for `provider` with file overrides applied.
    pub fn descriptor(&self, provider: Provider) -> ProviderDescriptor {
        let mut descriptor = match provider {
            Provider::QuickBooks => quickbooks::descriptor(self.quickbooks.environment),
            Provider::Ramp => ramp::descriptor(),
        };
        let overrides = self.provider_config(provider);
        if let Some(url) = &overrides.authorize_url {
            descriptor.authorize_url = url.clone();
        }
        if let Some(url) = &overrides.token_url {
            descriptor.token_url = url.clone();
        }
        if let Some(url) = &overrides.revoke_url {
            descriptor.revoke_url = url.clone();
        }
        if let Some(url) = &overrides.api_base_url {
            descriptor.api_base_url = url.clone();
        }
        descriptor
    }

    /// Adapters for every provider with complete client credentials.
    pub fn registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for provider in Provider::ALL {
            match self.provider_credentials(provider) {
                Some(credentials) => {
                    registry.register(Arc::new(StandardOAuthAdapter::new(
                        self.descriptor(provider),
                        credentials,
                    )));
                }
                None => debug!(provider = %provider, "provider not configured, skipping"),
            }
        }
        registry
    }

    pub fn retry_for(&self, provider: Provider) -> RetryConfig {
        self.provider_config(provider)
            .retry
            .clone()
            .unwrap_or_else(|| RetryConfig::for_provider(provider))
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            threshold: chrono::Duration::seconds(secs_i64(self.refresh.threshold_secs)),
            sweep_interval: std::time::Duration::from_secs(self.refresh.sweep_interval_secs.max(1)),
        }
    }

    pub fn state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.oauth.state_ttl_secs))
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.database.path, PathBuf::from("data/ledgerlink.db"));
        assert_eq!(config.refresh.sweep_interval_secs, 300);
        assert_eq!(config.refresh.threshold_secs, 1_800);
        assert_eq!(config.oauth.state_ttl_secs, 600);
        assert_eq!(config.quickbooks.environment, QuickBooksEnvironment::Sandbox);
        assert_eq!(config.retry_for(Provider::QuickBooks).initial_delay_ms, 2_000);
        assert_eq!(config.retry_for(Provider::Ramp), RetryConfig::default());
        assert_eq!(config.refresh_settings(), RefreshSettings::default());
        assert_eq!(config.state_ttl(), chrono::Duration::minutes(10));
    }

    #[test]
    fn parses_file_sections() {
        let config = Config::from_toml(
            r#"
            [database]
            path = "/var/lib/ledgerlink/ledgerlink.db"

            [refresh]
            sweep_interval_secs = 60

            [quickbooks]
            environment = "production"
            redirect_uri = "https://app.example.com/oauth/quickbooks"

            [ramp]
            token_url = "http://127.0.0.1:9000/token"

            [ramp.retry]
            max_attempts = 5
            initial_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.refresh.sweep_interval_secs, 60);
        assert_eq!(config.refresh.threshold_secs, 1_800);
        assert_eq!(config.quickbooks.environment, QuickBooksEnvironment::Production);
        assert_eq!(
            config.quickbooks.provider.redirect_uri.as_deref(),
            Some("https://app.example.com/oauth/quickbooks")
        );

        let retry = config.retry_for(Provider::Ramp);
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_delay_ms, 250);
        assert_eq!(retry.max_delay_ms, 30_000);

        let descriptor = config.descriptor(Provider::Ramp);
        assert_eq!(descriptor.token_url, "http://127.0.0.1:9000/token");
        assert_eq!(descriptor.api_base_url, "https://api.ramp.com/developer/v1");
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = Config::from_toml(
            r#"
            [ramp]
            redirect_uri = "http://localhost/file"
            "#,
        )
        .unwrap();
        config.apply_env(env(&[
            ("LEDGERLINK_DB_PATH", "/tmp/ll.db"),
            ("RAMP_REDIRECT_URI", "http://localhost/env"),
            ("QUICKBOOKS_ENVIRONMENT", "Production"),
            ("LEDGERLINK_APP_SECRET", "s3cret"),
        ]));

        assert_eq!(config.database.path, PathBuf::from("/tmp/ll.db"));
        assert_eq!(config.ramp.redirect_uri.as_deref(), Some("http://localhost/env"));
        assert_eq!(config.quickbooks.environment, QuickBooksEnvironment::Production);
        assert_eq!(config.app_secret().unwrap(), "s3cret");
    }

    #[test]
    fn missing_app_secret_is_an_error() {
        let mut config = Config::default();
        config.apply_env(env(&[("LEDGERLINK_APP_SECRET", "  ")]));
        assert!(config.app_secret().is_err());
    }

    #[test]
    fn registry_holds_only_complete_providers() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("RAMP_CLIENT_ID", "ramp-id"),
            ("RAMP_CLIENT_SECRET", "ramp-secret"),
            ("RAMP_REDIRECT_URI", "http://localhost:8400/callback"),
            ("QUICKBOOKS_CLIENT_ID", "qb-id"),
        ]));

        let registry = config.registry();
        assert_eq!(registry.providers(), vec![Provider::Ramp]);
        assert!(config.provider_credentials(Provider::QuickBooks).is_none());

        let ramp = config.provider_credentials(Provider::Ramp).unwrap();
        assert_eq!(ramp.client_id, "ramp-id");
        assert!(!format!("{:?}", config.secrets).contains("ramp-secret"));
    }

    #[test]
    fn explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(dir.path().join("absent.toml").as_path()));
        assert!(result.is_err());
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgerlink.toml");
        std::fs::write(&path, "[oauth]\nstate_ttl_secs = 120\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.state_ttl(), chrono::Duration::minutes(2));
    }
}
