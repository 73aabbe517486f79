//! Test doubles shared by the unit tests in this crate.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ledgerlink_store::Database;
use ledgerlink_vault::{
    AuditAction, AuditSink, Cipher, CredentialStore, SqliteAuditLog, VaultError,
};

use crate::error::{AuthEngineError, Result};
use crate::providers::{Provider, ProviderAdapter, TokenSet};

/// An in-process adapter that counts calls and can be told to fail.
pub struct FakeAdapter {
    provider: Provider,
    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    pub fail_revoke: AtomicBool,
    pub refresh_failure: Mutex<Option<String>>,
    pub refresh_outages: AtomicUsize,
    pub refresh_delay: Mutex<std::time::Duration>,
}

impl FakeAdapter {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            fail_revoke: AtomicBool::new(false),
            refresh_failure: Mutex::new(None),
            refresh_outages: AtomicUsize::new(0),
            refresh_delay: Mutex::new(std::time::Duration::ZERO),
        }
    }

    pub fn reject_refresh(&self, reason: &str) {
        *self.refresh_failure.lock().unwrap() = Some(reason.to_string());
    }

    /// Answer the next `times` refreshes with HTTP 503.
    pub fn refresh_unavailable(&self, times: usize) {
        self.refresh_outages.store(times, Ordering::SeqCst);
    }

    pub fn slow_refresh(&self, delay: std::time::Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    fn tokens(&self, access: String, refresh: Option<String>) -> TokenSet {
        TokenSet {
            access_token: access,
            refresh_token: refresh,
            expires_at: Some(Utc::now() + Duration::hours(1)),
            token_type: "Bearer".to_string(),
            scopes: Vec::new(),
            extras: serde_json::Map::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn api_base_url(&self) -> &str {
        "http://127.0.0.1:9/api"
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        Ok(format!(
            "https://auth.example.com/{}/authorize?response_type=code&state={state}",
            self.provider
        ))
    }

    async fn exchange_code_for_tokens(
        &self,
        code: &str,
        _callback_params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<TokenSet> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tokens(
            format!("{}-access-{code}", self.provider),
            Some(format!("{}-refresh-{code}", self.provider)),
        ))
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenSet> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.refresh_failure.lock().unwrap().clone() {
            return Err(AuthEngineError::InvalidGrant { reason });
        }
        if self
            .refresh_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AuthEngineError::TokenEndpoint {
                status: 503,
                reason: "service unavailable".to_string(),
            });
        }
        Ok(self.tokens(
            format!("{}-access-r{n}", self.provider),
            Some(refresh_token.to_string()),
        ))
    }

    async fn revoke_tokens(&self, _token: &str) -> Result<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err(AuthEngineError::TokenEndpoint {
                status: 503,
                reason: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// A credential store over a fresh in-memory database, plus its audit log.
pub async fn credential_store() -> (CredentialStore, Arc<SqliteAuditLog>) {
    let db = Database::in_memory_migrated().await.unwrap();
    let cipher = Cipher::with_iterations("test-secret", NonZeroU32::new(1).unwrap()).unwrap();
    let audit = Arc::new(SqliteAuditLog::new(db.clone()));
    (
        CredentialStore::new(db, Arc::new(cipher), audit.clone()),
        audit,
    )
}

/// An audit sink whose every write fails.
pub struct BrokenAuditSink;

#[async_trait]
impl AuditSink for BrokenAuditSink {
    async fn record(
        &self,
        _provider: &str,
        _action: AuditAction,
        _detail: Option<&str>,
    ) -> ledgerlink_vault::Result<()> {
        Err(VaultError::Internal("audit log unavailable".to_string()))
    }
}

/// A credential store whose audit writes always fail.
pub async fn credential_store_without_audit() -> CredentialStore {
    let db = Database::in_memory_migrated().await.unwrap();
    let cipher = Cipher::with_iterations("test-secret", NonZeroU32::new(1).unwrap()).unwrap();
    CredentialStore::new(db, Arc::new(cipher), Arc::new(BrokenAuditSink))
}
