//! OAuth state tokens and where they are kept between redirect and callback.
//!
//! A state token is a single-use capability with a TTL. [`StateStore::take`]
//! removes the entry atomically, so a token can be consumed at most once no
//! matter how many callbacks race for it. Expiry is judged by the caller
//! against its clock; stores only drop expired entries opportunistically.
//!
//! Two backends are provided:
//!
//! - [`MemoryStateStore`]: process-local, for single-instance deployments.
//! - [`SqliteStateStore`]: the shared `oauth_states` table, so any instance
//!   can finish a flow another instance started.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerlink_store::Database;
use moka::future::Cache;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::providers::Provider;

/// Upper bound on concurrently pending flows held in memory.
const MEMORY_STATE_CAPACITY: u64 = 10_000;

/// A pending authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub provider: Provider,
    pub state_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthState {
    /// Whether the state can no longer be used at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Storage for pending OAuth states.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Remember a newly issued state.
    async fn insert(&self, state: OAuthState) -> Result<()>;

    /// Remove and return the state for `token`, expired or not.
    async fn take(&self, token: &str) -> Result<Option<OAuthState>>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local state store.
///
/// Entries are evicted by `moka` some time after `ttl`; expiry at
/// verification time is still decided by the caller's clock.
pub struct MemoryStateStore {
    states: Cache<String, OAuthState>,
}

impl MemoryStateStore {
    pub fn new(ttl: StdDuration) -> Self {
        // Evict a little after the logical TTL so the caller, not the cache,
        // decides when a state expired.
        let states = Cache::builder()
            .max_capacity(MEMORY_STATE_CAPACITY)
            .time_to_live(ttl + StdDuration::from_secs(60))
            .build();
        Self { states }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert(&self, state: OAuthState) -> Result<()> {
        self.states.insert(state.state_token.clone(), state).await;
        Ok(())
    }

    async fn take(&self, token: &str) -> Result<Option<OAuthState>> {
        Ok(self.states.remove(token).await)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// State store backed by the shared database.
#[derive(Clone)]
pub struct SqliteStateStore {
    db: Database,
}

impl SqliteStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn insert(&self, state: OAuthState) -> Result<()> {
        let created = state.created_at.timestamp_millis();
        let expires = state.expires_at.timestamp_millis();

        let purged = self
            .db
            .execute(move |conn| {
                let purged = conn.execute(
                    "DELETE FROM oauth_states WHERE expires_at <= ?1",
                    params![created],
                )?;
                conn.execute(
                    "INSERT INTO oauth_states (state_token, provider, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![state.state_token, state.provider.as_str(), created, expires],
                )?;
                Ok(purged)
            })
            .await?;

        if purged > 0 {
            tracing::debug!(purged, "removed expired oauth states");
        }
        Ok(())
    }

    async fn take(&self, token: &str) -> Result<Option<OAuthState>> {
        let token = token.to_string();
        let row = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "DELETE FROM oauth_states WHERE state_token = ?1
                         RETURNING state_token, provider, created_at, expires_at",
                        params![token],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, i64>(3)?,
                            ))
                        },
                    )
                    .optional()?)
            })
            .await?;

        let Some((state_token, provider, created, expires)) = row else {
            return Ok(None);
        };
        let Some(provider) = Provider::parse(&provider) else {
            tracing::warn!(provider = %provider, "discarding oauth state for unknown provider");
            return Ok(None);
        };

        Ok(Some(OAuthState {
            provider,
            state_token,
            created_at: DateTime::from_timestamp_millis(created).unwrap_or_default(),
            expires_at: DateTime::from_timestamp_millis(expires).unwrap_or_default(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
