//! SQLite-backed encrypted credential store.
//!
//! The [`CredentialStore`] owns the `integration_credentials` table: one row
//! per provider holding the encrypted access/refresh tokens, their expiry,
//! a JSON metadata map and the connection status. Tokens are encrypted with
//! the vault [`Cipher`] before being written and decrypted on read; the
//! plaintext never reaches SQLite.
//!
//! # Status transitions
//!
//! ```text
//! (none) ──store──▶ active ──mark_error──▶ error
//!                     │  ◀──────store──────┘
//!                     └──mark_disconnected──▶ disconnected ──store──▶ active
//! ```
//!
//! Rows are never deleted; the status records the history.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ledgerlink_store::Database;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditAction, AuditSink, record_best_effort};
use crate::crypto::Cipher;
use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Connection status of a provider credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Tokens are trusted and refreshed automatically.
    Active,
    /// A refresh failed; the user must reconnect through a new OAuth flow.
    Error,
    /// Tokens lapsed without a usable refresh token.
    Expired,
    /// The user disconnected the integration.
    Disconnected,
}

impl CredentialStatus {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::Expired => "expired",
            Self::Disconnected => "disconnected",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "expired" => Some(Self::Expired),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext tokens handed to [`CredentialStore::store_credentials`].
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    /// `None` keeps whatever refresh token is already stored.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Merged key-by-key into the existing metadata map.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl std::fmt::Debug for StoredTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredTokens")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// A credential row with its tokens decrypted.
#[derive(Clone, Serialize, Deserialize)]
pub struct IntegrationCredential {
    pub id: i64,
    pub provider: String,
    /// `None` once the integration is disconnected.
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: CredentialStatus,
    pub last_error: Option<String>,
    /// Incremented on every token write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for IntegrationCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationCredential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .field("version", &self.version)
            .finish()
    }
}

/// Status of a credential without any decrypted material.
///
/// Returned by [`CredentialStore::list_statuses`] for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub provider: String,
    pub status: CredentialStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub has_refresh_token: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A credential the refresh sweep should renew.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCandidate {
    pub provider: String,
    pub expires_at: DateTime<Utc>,
}

/// The encrypted row as stored, before decryption.
struct RawCredential {
    id: i64,
    provider: String,
    access_token_encrypted: Option<String>,
    refresh_token_encrypted: Option<String>,
    expires_at: Option<i64>,
    config: String,
    status: String,
    last_error: Option<String>,
    version: i64,
    created_at: i64,
    updated_at: i64,
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// Encrypted per-provider credential storage.
#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
    cipher: Arc<Cipher>,
    audit: Arc<dyn AuditSink>,
}

impl CredentialStore {
    pub fn new(db: Database, cipher: Arc<Cipher>, audit: Arc<dyn AuditSink>) -> Self {
        Self { db, cipher, audit }
    }

    /// The audit sink this store reports to.
    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Upsert the tokens for `provider` and mark it `active`.
    ///
    /// Tokens are encrypted before the write. `metadata` is merged into the
    /// existing map, and a missing refresh token keeps the stored one. Any
    /// previous `last_error` is cleared.
    #[instrument(skip(self, tokens))]
    pub async fn store_credentials(&self, provider: &str, tokens: &StoredTokens) -> Result<()> {
        let access = self.cipher.encrypt(&tokens.access_token)?;
        let refresh = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;
        let expires_at = tokens.expires_at.map(|t| t.timestamp_millis());
        let incoming = tokens.metadata.clone();
        let provider_owned = provider.to_string();
        let now = Utc::now().timestamp_millis();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let existing: Option<String> = tx
                    .query_row(
                        "SELECT config FROM integration_credentials WHERE provider = ?1",
                        params![provider_owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                let mut metadata = existing
                    .as_deref()
                    .map(serde_json::from_str::<serde_json::Map<String, serde_json::Value>>)
                    .transpose()?
                    .unwrap_or_default();
                metadata.extend(incoming);
                let config = serde_json::to_string(&metadata)?;

                tx.execute(
                    "INSERT INTO integration_credentials
                        (provider, access_token_encrypted, refresh_token_encrypted,
                         token_expires_at, config, status, last_error, version,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'active', NULL, 1, ?6, ?6)
                     ON CONFLICT(provider) DO UPDATE SET
                        access_token_encrypted  = excluded.access_token_encrypted,
                        refresh_token_encrypted = COALESCE(excluded.refresh_token_encrypted,
                                                           integration_credentials.refresh_token_encrypted),
                        token_expires_at        = excluded.token_expires_at,
                        config                  = excluded.config,
                        status                  = 'active',
                        last_error              = NULL,
                        version                 = integration_credentials.version + 1,
                        updated_at              = excluded.updated_at",
                    params![provider_owned, access, refresh, expires_at, config, now],
                )?;

                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(
            provider = provider,
            expires_at = ?tokens.expires_at,
            has_refresh_token = tokens.refresh_token.is_some(),
            "credentials stored"
        );
        Ok(())
    }

    /// Read and decrypt the credential for `provider`.
    ///
    /// Returns `Ok(None)` when no row exists. A ciphertext that fails to
    /// decrypt is an error, never silently dropped. A `token_accessed` audit
    /// event is recorded on success.
    #[instrument(skip(self))]
    pub async fn get_credentials(&self, provider: &str) -> Result<Option<IntegrationCredential>> {
        let Some(credential) = self.load_credentials(provider).await? else {
            return Ok(None);
        };

        record_best_effort(
            self.audit.as_ref(),
            provider,
            AuditAction::TokenAccessed,
            None,
        )
        .await;

        Ok(Some(credential))
    }

    /// Like [`get_credentials`](Self::get_credentials) but without the
    /// access audit, for re-reads within a call that already recorded one.
    pub async fn load_credentials(&self, provider: &str) -> Result<Option<IntegrationCredential>> {
        match self.fetch_raw(provider).await? {
            Some(raw) => Ok(Some(self.decrypt_row(raw)?)),
            None => Ok(None),
        }
    }

    /// Record a failure and flip the status to `error`.
    #[instrument(skip(self))]
    pub async fn mark_error(&self, provider: &str, message: &str) -> Result<()> {
        let provider_owned = provider.to_string();
        let message = message.to_string();
        let now = Utc::now().timestamp_millis();

        let rows = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "UPDATE integration_credentials
                     SET status = 'error', last_error = ?2, updated_at = ?3
                     WHERE provider = ?1",
                    params![provider_owned, message, now],
                )?)
            })
            .await?;

        if rows == 0 {
            return Err(VaultError::CredentialNotFound {
                provider: provider.to_string(),
            });
        }
        warn!(provider = provider, "credential marked as error");
        Ok(())
    }

    /// Clear the encrypted tokens and set the status to `disconnected`.
    ///
    /// Metadata is kept so that a later reconnect merges into it.
    #[instrument(skip(self))]
    pub async fn mark_disconnected(&self, provider: &str) -> Result<()> {
        let provider_owned = provider.to_string();
        let now = Utc::now().timestamp_millis();

        let rows = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "UPDATE integration_credentials
                     SET access_token_encrypted = NULL,
                         refresh_token_encrypted = NULL,
                         token_expires_at = NULL,
                         status = 'disconnected',
                         last_error = NULL,
                         updated_at = ?2
                     WHERE provider = ?1",
                    params![provider_owned, now],
                )?)
            })
            .await?;

        if rows == 0 {
            return Err(VaultError::CredentialNotFound {
                provider: provider.to_string(),
            });
        }
        info!(provider = provider, "credential disconnected");
        Ok(())
    }

    /// Active credentials with a refresh token whose expiry falls before
    /// `now + threshold`, soonest first.
    #[instrument(skip(self))]
    pub async fn due_for_refresh(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<RefreshCandidate>> {
        let cutoff = (now + threshold).timestamp_millis();

        let rows: Vec<(String, i64)> = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT provider, token_expires_at FROM integration_credentials
                     WHERE status = 'active'
                       AND refresh_token_encrypted IS NOT NULL
                       AND token_expires_at IS NOT NULL
                       AND token_expires_at < ?1
                     ORDER BY token_expires_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        debug!(due = rows.len(), "queried credentials due for refresh");
        Ok(rows
            .into_iter()
            .map(|(provider, expires)| RefreshCandidate {
                provider,
                expires_at: DateTime::from_timestamp_millis(expires).unwrap_or_default(),
            })
            .collect())
    }

    /// Status of every stored credential, without decrypting anything.
    pub async fn list_statuses(&self) -> Result<Vec<CredentialSummary>> {
        let rows = self
            .db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT provider, status, token_expires_at,
                            refresh_token_encrypted IS NOT NULL, last_error, updated_at
                     FROM integration_credentials
                     ORDER BY provider",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let status: String = row.get(1)?;
                        Ok(CredentialSummary {
                            provider: row.get(0)?,
                            status: CredentialStatus::parse(&status)
                                .unwrap_or(CredentialStatus::Error),
                            expires_at: row
                                .get::<_, Option<i64>>(2)?
                                .and_then(DateTime::from_timestamp_millis),
                            has_refresh_token: row.get(3)?,
                            last_error: row.get(4)?,
                            updated_at: DateTime::from_timestamp_millis(row.get(5)?)
                                .unwrap_or_default(),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    // -- internals ----------------------------------------------------------

    async fn fetch_raw(&self, provider: &str) -> Result<Option<RawCredential>> {
        let provider = provider.to_string();
        let raw = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, provider, access_token_encrypted, refresh_token_encrypted,
                                token_expires_at, config, status, last_error, version,
                                created_at, updated_at
                         FROM integration_credentials WHERE provider = ?1",
                        params![provider],
                        |row| {
                            Ok(RawCredential {
                                id: row.get(0)?,
                                provider: row.get(1)?,
                                access_token_encrypted: row.get(2)?,
                                refresh_token_encrypted: row.get(3)?,
                                expires_at: row.get(4)?,
                                config: row.get(5)?,
                                status: row.get(6)?,
                                last_error: row.get(7)?,
                                version: row.get(8)?,
                                created_at: row.get(9)?,
                                updated_at: row.get(10)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?;
        Ok(raw)
    }

    fn decrypt_row(&self, raw: RawCredential) -> Result<IntegrationCredential> {
        let access_token = raw
            .access_token_encrypted
            .as_deref()
            .map(|c| self.cipher.decrypt(c))
            .transpose()?;
        let refresh_token = raw
            .refresh_token_encrypted
            .as_deref()
            .map(|c| self.cipher.decrypt(c))
            .transpose()?;
        let metadata = serde_json::from_str(&raw.config)?;
        let status = CredentialStatus::parse(&raw.status).ok_or_else(|| {
            VaultError::Internal(format!("unknown credential status: {}", raw.status))
        })?;

        Ok(IntegrationCredential {
            id: raw.id,
            provider: raw.provider,
            access_token,
            refresh_token,
            expires_at: raw.expires_at.and_then(DateTime::from_timestamp_millis),
            metadata,
            status,
            last_error: raw.last_error,
            version: raw.version,
            created_at: DateTime::from_timestamp_millis(raw.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(raw.updated_at).unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
