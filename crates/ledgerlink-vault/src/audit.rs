//! Audit log for credential lifecycle events.
//!
//! Every token issue, refresh, read and disconnect is reported to an
//! [`AuditSink`]. Writes are best-effort from the caller's point of view:
//! [`record_best_effort`] swallows and logs failures so that an audit outage
//! never aborts the operation being audited.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerlink_store::Database;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The kind of credential event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A new token set was obtained through the OAuth callback.
    TokenCreated,
    /// Tokens were renewed with the refresh grant.
    TokenRefreshed,
    /// Decrypted tokens were read from the store.
    TokenAccessed,
    /// A refresh attempt was rejected or failed.
    TokenRefreshFailed,
    /// The integration was disconnected and its tokens cleared.
    IntegrationDisconnected,
}

impl AuditAction {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenCreated => "token_created",
            Self::TokenRefreshed => "token_refreshed",
            Self::TokenAccessed => "token_accessed",
            Self::TokenRefreshFailed => "token_refresh_failed",
            Self::IntegrationDisconnected => "integration_disconnected",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "token_created" => Some(Self::TokenCreated),
            "token_refreshed" => Some(Self::TokenRefreshed),
            "token_accessed" => Some(Self::TokenAccessed),
            "token_refresh_failed" => Some(Self::TokenRefreshFailed),
            "integration_disconnected" => Some(Self::IntegrationDisconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Database row ID.
    pub id: i64,

    /// The provider involved.
    pub provider: String,

    /// The event that happened.
    pub action: AuditAction,

    /// Additional detail or context. Never contains secrets.
    pub detail: Option<String>,

    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one event.
    async fn record(&self, provider: &str, action: AuditAction, detail: Option<&str>)
    -> Result<()>;
}

/// Record an event, logging instead of propagating any failure.
pub async fn record_best_effort(
    sink: &dyn AuditSink,
    provider: &str,
    action: AuditAction,
    detail: Option<&str>,
) {
    if let Err(e) = sink.record(provider, action, detail).await {
        tracing::warn!(
            provider = provider,
            action = %action,
            error = %e,
            "failed to write audit entry"
        );
    }
}

/// Audit sink backed by the `audit_log` table of the shared database.
#[derive(Clone)]
pub struct SqliteAuditLog {
    db: Database,
}

impl SqliteAuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Most recent entries first, optionally filtered by provider.
    pub async fn query_recent(
        &self,
        provider: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let provider = provider.map(str::to_string);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let entries = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, provider, action, detail, timestamp
                     FROM audit_log
                     WHERE ?1 IS NULL OR provider = ?1
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?2",
                )?;
                let entries = stmt
                    .query_map(params![provider, limit], map_audit_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(entries.into_iter().flatten().collect::<Vec<_>>())
            })
            .await?;

        Ok(entries)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn record(
        &self,
        provider: &str,
        action: AuditAction,
        detail: Option<&str>,
    ) -> Result<()> {
        let provider_owned = provider.to_string();
        let detail = detail.map(str::to_string);
        let now = Utc::now().timestamp_millis();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log (provider, action, detail, timestamp)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![provider_owned, action.as_str(), detail, now],
                )?;
                Ok(())
            })
            .await?;

        tracing::trace!(provider = provider, action = %action, "audit entry recorded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

/// Rows with an unknown action string are skipped rather than failing the
/// whole query.
fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<AuditEntry>> {
    let Some(action) = AuditAction::parse(&row.get::<_, String>(2)?) else {
        return Ok(None);
    };
    Ok(Some(AuditEntry {
        id: row.get(0)?,
        provider: row.get(1)?,
        action,
        detail: row.get(3)?,
        timestamp: DateTime::from_timestamp_millis(row.get::<_, i64>(4)?).unwrap_or_default(),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
