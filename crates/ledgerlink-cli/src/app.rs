//! Wiring of the library crates into one runtime.

use std::sync::Arc;

use anyhow::{Context, Result};
use ledgerlink_auth_engine::providers::quickbooks::REALM_ID;
use ledgerlink_auth_engine::{
    OAuthFlowManager, Provider, ProviderRegistry, RefreshScheduler, SqliteStateStore, SystemClock,
    TokenRefresher,
};
use ledgerlink_client::{ApiClient, ApiClientConfig, create_api_client};
use ledgerlink_store::Database;
use ledgerlink_vault::{Cipher, CredentialStore, SqliteAuditLog};
use tracing::info;

use crate::config::Config;

/// Open (and migrate) the configured database, creating its directory.
pub async fn open_database(config: &Config) -> Result<Database> {
    let path = config.database.path.clone();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }

    let db = Database::open_and_migrate(path.clone())
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;
    info!(path = %path.display(), "store initialized");
    Ok(db)
}

/// Everything a credential-touching command needs.
pub struct App {
    pub config: Config,
    pub db: Database,
    pub audit: Arc<SqliteAuditLog>,
    pub credentials: CredentialStore,
    pub registry: Arc<ProviderRegistry>,
    pub refresher: Arc<TokenRefresher>,
}

impl App {
    pub async fn open(config: Config) -> Result<Self> {
        let db = open_database(&config).await?;
        let cipher = Cipher::new(config.app_secret()?).context("failed to derive vault key")?;
        let audit = Arc::new(SqliteAuditLog::new(db.clone()));
        let credentials = CredentialStore::new(db.clone(), Arc::new(cipher), audit.clone());
        let registry = Arc::new(config.registry());

        let refresher = Arc::new(TokenRefresher::new(
            registry.clone(),
            credentials.clone(),
            Arc::new(SystemClock),
            config.refresh_settings().threshold,
        ));

        Ok(Self {
            config,
            db,
            audit,
            credentials,
            registry,
            refresher,
        })
    }

    /// Flow manager backed by the database state store, so `connect` and
    /// `callback` may run in different processes.
    pub fn flow(&self) -> OAuthFlowManager {
        OAuthFlowManager::new(
            self.registry.clone(),
            Arc::new(SqliteStateStore::new(self.db.clone())),
            self.credentials.clone(),
            Arc::new(SystemClock),
        )
        .with_state_ttl(self.config.state_ttl())
    }

    pub fn scheduler(&self) -> Arc<RefreshScheduler> {
        Arc::new(RefreshScheduler::new(
            self.refresher.clone(),
            self.config.refresh_settings().sweep_interval,
        ))
    }

    /// API client for `provider`. QuickBooks calls are scoped to the
    /// company id stored at connect time.
    pub async fn api_client(&self, provider: Provider) -> Result<ApiClient> {
        let adapter = self.registry.get(provider)?;
        let mut config = ApiClientConfig::for_adapter(adapter.as_ref())
            .with_retry(self.config.retry_for(provider));

        if provider == Provider::QuickBooks {
            let credential = self
                .credentials
                .get_credentials(provider.as_str())
                .await?
                .with_context(|| format!("{provider} is not connected"))?;
            let realm_id = credential
                .metadata
                .get(REALM_ID)
                .and_then(|v| v.as_str())
                .with_context(|| format!("{provider} credential has no {REALM_ID}"))?;
            config.base_url = format!("{}/{realm_id}", config.base_url.trim_end_matches('/'));
        }

        Ok(create_api_client(config, self.refresher.clone())?)
    }
}
