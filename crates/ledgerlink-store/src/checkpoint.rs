//! Durable progress tracking for long-running batch synchronizations.
//!
//! A [`SyncCheckpoint`] row records how far a bulk sync against a provider
//! has progressed (cursor plus processed/failed counters), so that a crashed
//! or paused sync resumes from the last recorded position instead of the
//! beginning.
//!
//! # Lifecycle
//!
//! ```text
//! in_progress  -->  completed          (terminal, immutable)
//!              \->  failed             (resumable via resume())
//!              <->  paused             (cooperative)
//! ```
//!
//! Counters only ever grow: [`SyncCheckpointManager::update_progress`]
//! increments them inside a single `UPDATE` statement.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle state of a sync checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// The sync is running (or crashed while running).
    InProgress,
    /// The sync finished; the row is immutable from now on.
    Completed,
    /// The sync stopped with an error and may be resumed.
    Failed,
    /// The sync was paused cooperatively.
    Paused,
}

impl CheckpointStatus {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted sync checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// The integration being synced (e.g. "quickbooks").
    pub integration: String,
    /// The kind of records being synced (e.g. "bills").
    pub sync_type: String,
    /// Identifier of the last record included in a recorded batch.
    pub last_processed_id: Option<String>,
    /// When the cursor last moved.
    pub last_processed_at: Option<DateTime<Utc>>,
    pub total_records: u64,
    pub processed_records: u64,
    pub failed_records: u64,
    pub status: CheckpointStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Progress summary derived from a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub checkpoint_id: String,
    pub status: CheckpointStatus,
    pub total_records: u64,
    pub processed_records: u64,
    pub failed_records: u64,
    /// `processed / total` as a whole percentage, clamped to 0..=100.
    pub percentage: u8,
    pub last_processed_id: Option<String>,
}

/// Records that can be walked by [`SyncCheckpointManager::batched_sync`].
///
/// The identifier of the last record in a batch becomes the checkpoint
/// cursor.
pub trait SyncItem {
    /// Stable identifier of this record, if it has one.
    fn sync_id(&self) -> Option<String>;
}

impl SyncItem for String {
    fn sync_id(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl SyncItem for serde_json::Value {
    /// Reads `id`, falling back to `Id` (QuickBooks entity casing).
    fn sync_id(&self) -> Option<String> {
        let id = self.get("id").or_else(|| self.get("Id"))?;
        match id {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SyncCheckpointManager
// ═══════════════════════════════════════════════════════════════════════

const CHECKPOINT_COLUMNS: &str = "id, integration_type, sync_type, last_processed_id, \
     last_processed_at, total_records, processed_records, failed_records, status, \
     error_message, created_at, updated_at";

/// CRUD and lifecycle operations on sync checkpoints.
#[derive(Clone)]
pub struct SyncCheckpointManager {
    db: Database,
}

impl SyncCheckpointManager {
    /// Create a new checkpoint manager backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Start tracking a new batch sync with zeroed counters.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        integration: &str,
        sync_type: &str,
        total_records: u64,
    ) -> StoreResult<SyncCheckpoint> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now();
        let total = to_sql_count(total_records)?;

        let checkpoint = SyncCheckpoint {
            id: id.clone(),
            integration: integration.to_string(),
            sync_type: sync_type.to_string(),
            last_processed_id: None,
            last_processed_at: None,
            total_records,
            processed_records: 0,
            failed_records: 0,
            status: CheckpointStatus::InProgress,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        let integration = integration.to_string();
        let sync_type = sync_type.to_string();
        let now_ms = now.timestamp_millis();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO sync_checkpoints (id, integration_type, sync_type, total_records, \
                     processed_records, failed_records, status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 0, 0, 'in_progress', ?5, ?5)",
                    params![id, integration, sync_type, total, now_ms],
                )?;
                Ok(())
            })
            .await?;

        info!(
            checkpoint_id = %checkpoint.id,
            integration = %checkpoint.integration,
            sync_type = %checkpoint.sync_type,
            total_records,
            "sync checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Fetch a checkpoint by id.
    #[instrument(skip(self))]
    pub async fn get(&self, checkpoint_id: &str) -> StoreResult<SyncCheckpoint> {
        let id = checkpoint_id.to_string();
        self.db
            .execute(move |conn| {
                fetch(conn, &id)?.ok_or(StoreError::CheckpointNotFound { id })
            })
            .await
    }

    /// Increment the counters and move the cursor.
    ///
    /// `last_processed_id` of `None` leaves the cursor where it was, which is
    /// how callers record failures without advancing. Only `in_progress` and
    /// `paused` checkpoints accept updates.
    #[instrument(skip(self))]
    pub async fn update_progress(
        &self,
        checkpoint_id: &str,
        last_processed_id: Option<&str>,
        processed: u64,
        failed: u64,
    ) -> StoreResult<()> {
        let id = checkpoint_id.to_string();
        let cursor = last_processed_id.map(str::to_string);
        let processed = to_sql_count(processed)?;
        let failed = to_sql_count(failed)?;
        let now_ms = Utc::now().timestamp_millis();

        self.db
            .execute(move |conn| {
                let rows = conn.execute(
                    "UPDATE sync_checkpoints SET \
                       processed_records = processed_records + ?2, \
                       failed_records = failed_records + ?3, \
                       last_processed_id = COALESCE(?4, last_processed_id), \
                       last_processed_at = CASE WHEN ?4 IS NULL THEN last_processed_at ELSE ?5 END, \
                       updated_at = ?5 \
                     WHERE id = ?1 AND status IN ('in_progress', 'paused')",
                    params![id, processed, failed, cursor, now_ms],
                )?;
                if rows == 0 {
                    return Err(not_mutable(conn, &id)?);
                }
                Ok(())
            })
            .await?;

        debug!(
            checkpoint_id = checkpoint_id,
            processed, failed, "sync progress recorded"
        );
        Ok(())
    }

    /// Finalize a checkpoint as `completed` or `failed`.
    ///
    /// This is a terminal write: afterwards no progress update is accepted.
    #[instrument(skip(self))]
    pub async fn complete(
        &self,
        checkpoint_id: &str,
        status: CheckpointStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        if !matches!(status, CheckpointStatus::Completed | CheckpointStatus::Failed) {
            return Err(StoreError::InvalidTransition {
                id: checkpoint_id.to_string(),
                from: "in_progress".into(),
                to: status.to_string(),
            });
        }

        let id = checkpoint_id.to_string();
        let message = error_message.map(str::to_string);
        let now_ms = Utc::now().timestamp_millis();

        self.db
            .execute(move |conn| {
                let rows = conn.execute(
                    "UPDATE sync_checkpoints SET status = ?2, error_message = ?3, updated_at = ?4 \
                     WHERE id = ?1 AND status IN ('in_progress', 'paused')",
                    params![id, status.as_str(), message, now_ms],
                )?;
                if rows == 0 {
                    return Err(not_mutable(conn, &id)?);
                }
                Ok(())
            })
            .await?;

        if status == CheckpointStatus::Failed {
            warn!(checkpoint_id = checkpoint_id, error = ?error_message, "sync checkpoint failed");
        } else {
            info!(checkpoint_id = checkpoint_id, "sync checkpoint completed");
        }
        Ok(())
    }

    /// The most recent checkpoint for `(integration, sync_type)` that has not
    /// completed.
    #[instrument(skip(self))]
    pub async fn get_resumable(
        &self,
        integration: &str,
        sync_type: &str,
    ) -> StoreResult<Option<SyncCheckpoint>> {
        let integration = integration.to_string();
        let sync_type = sync_type.to_string();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM sync_checkpoints \
                     WHERE integration_type = ?1 AND sync_type = ?2 \
                       AND status IN ('in_progress', 'failed', 'paused') \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                );
                let checkpoint = conn
                    .query_row(&sql, params![integration, sync_type], map_checkpoint_row)
                    .optional()?;
                Ok(checkpoint)
            })
            .await
    }

    /// Flip a paused or failed checkpoint back to `in_progress` and return
    /// its cursor so the caller can skip already-processed records.
    #[instrument(skip(self))]
    pub async fn resume(&self, checkpoint_id: &str) -> StoreResult<Option<String>> {
        let id = checkpoint_id.to_string();
        let now_ms = Utc::now().timestamp_millis();

        let cursor = self
            .db
            .execute(move |conn| {
                let cursor: Option<Option<String>> = conn
                    .query_row(
                        "UPDATE sync_checkpoints SET status = 'in_progress', error_message = NULL, \
                         updated_at = ?2 \
                         WHERE id = ?1 AND status IN ('in_progress', 'paused', 'failed') \
                         RETURNING last_processed_id",
                        params![id, now_ms],
                        |row| row.get(0),
                    )
                    .optional()?;
                match cursor {
                    Some(cursor) => Ok(cursor),
                    None => Err(not_mutable(conn, &id)?),
                }
            })
            .await?;

        info!(checkpoint_id = checkpoint_id, cursor = ?cursor, "sync checkpoint resumed");
        Ok(cursor)
    }

    /// Mark an `in_progress` checkpoint as `paused`.
    ///
    /// Cooperative: a batch loop already running is not interrupted, it only
    /// stops before requesting its next batch.
    #[instrument(skip(self))]
    pub async fn pause(&self, checkpoint_id: &str) -> StoreResult<()> {
        let id = checkpoint_id.to_string();
        let now_ms = Utc::now().timestamp_millis();

        self.db
            .execute(move |conn| {
                let rows = conn.execute(
                    "UPDATE sync_checkpoints SET status = 'paused', updated_at = ?2 \
                     WHERE id = ?1 AND status = 'in_progress'",
                    params![id, now_ms],
                )?;
                if rows > 0 {
                    return Ok(());
                }
                match current_status(conn, &id)? {
                    None => Err(StoreError::CheckpointNotFound { id }),
                    Some(CheckpointStatus::Paused) => Ok(()),
                    Some(other) => Err(StoreError::InvalidTransition {
                        id,
                        from: other.to_string(),
                        to: CheckpointStatus::Paused.to_string(),
                    }),
                }
            })
            .await?;

        info!(checkpoint_id = checkpoint_id, "sync checkpoint paused");
        Ok(())
    }

    /// Resume the latest resumable checkpoint, or create a fresh one.
    ///
    /// Returns the checkpoint together with the cursor to skip past.
    pub async fn resume_or_create(
        &self,
        integration: &str,
        sync_type: &str,
        total_records: u64,
    ) -> StoreResult<(SyncCheckpoint, Option<String>)> {
        if let Some(existing) = self.get_resumable(integration, sync_type).await? {
            let cursor = self.resume(&existing.id).await?;
            let checkpoint = self.get(&existing.id).await?;
            return Ok((checkpoint, cursor));
        }
        let checkpoint = self.create(integration, sync_type, total_records).await?;
        Ok((checkpoint, None))
    }

    /// Progress summary for a checkpoint.
    pub async fn get_progress(&self, checkpoint_id: &str) -> StoreResult<SyncProgress> {
        let checkpoint = self.get(checkpoint_id).await?;
        Ok(SyncProgress {
            percentage: percentage(checkpoint.processed_records, checkpoint.total_records),
            checkpoint_id: checkpoint.id,
            status: checkpoint.status,
            total_records: checkpoint.total_records,
            processed_records: checkpoint.processed_records,
            failed_records: checkpoint.failed_records,
            last_processed_id: checkpoint.last_processed_id,
        })
    }

    /// Keep only the `keep` most recent completed checkpoints for
    /// `(integration, sync_type)`. Returns how many rows were deleted.
    #[instrument(skip(self))]
    pub async fn cleanup_old(
        &self,
        integration: &str,
        sync_type: &str,
        keep: usize,
    ) -> StoreResult<usize> {
        let label = format!("{integration}/{sync_type}");
        let integration = integration.to_string();
        let sync_type = sync_type.to_string();
        let keep = i64::try_from(keep)
            .map_err(|_| StoreError::InvalidArgument(format!("keep count too large: {keep}")))?;

        let deleted = self
            .db
            .execute(move |conn| {
                let rows = conn.execute(
                    "DELETE FROM sync_checkpoints \
                     WHERE integration_type = ?1 AND sync_type = ?2 AND status = 'completed' \
                       AND id NOT IN ( \
                         SELECT id FROM sync_checkpoints \
                         WHERE integration_type = ?1 AND sync_type = ?2 AND status = 'completed' \
                         ORDER BY created_at DESC, rowid DESC LIMIT ?3)",
                    params![integration, sync_type, keep],
                )?;
                Ok(rows)
            })
            .await?;

        debug!(sync = %label, deleted, "old sync checkpoints removed");
        Ok(deleted)
    }

    /// Walk `items` in batches of `batch_size`, checkpointing as it goes.
    ///
    /// The returned stream is lazy: each batch is produced only when the
    /// caller asks for the next one. Progress for the batches handed out so
    /// far is written after every `checkpoint_interval` batches and after
    /// the final batch, before the next batch (or the end of the stream) is
    /// returned. The cursor is the id of the last item in the newest batch.
    ///
    /// The walk stops early, without error, when the checkpoint has been
    /// paused; progress for batches already handed out is recorded first.
    pub fn batched_sync<T>(
        &self,
        checkpoint_id: &str,
        items: Vec<T>,
        batch_size: usize,
        checkpoint_interval: usize,
    ) -> StoreResult<BoxStream<'static, StoreResult<Vec<T>>>>
    where
        T: SyncItem + Send + 'static,
    {
        if batch_size == 0 {
            return Err(StoreError::InvalidArgument("batch_size must be > 0".into()));
        }
        if checkpoint_interval == 0 {
            return Err(StoreError::InvalidArgument(
                "checkpoint_interval must be > 0".into(),
            ));
        }

        let walk = BatchWalk {
            manager: self.clone(),
            checkpoint_id: checkpoint_id.to_string(),
            remaining: items.into_iter(),
            batch_size,
            checkpoint_interval,
            batches_since_checkpoint: 0,
            pending_records: 0,
            pending_cursor: None,
            finished: false,
        };

        Ok(stream::unfold(walk, |mut walk| async move {
            walk.advance().await.map(|item| (item, walk))
        })
        .boxed())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Batch walk state
// ═══════════════════════════════════════════════════════════════════════

struct BatchWalk<T> {
    manager: SyncCheckpointManager,
    checkpoint_id: String,
    remaining: std::vec::IntoIter<T>,
    batch_size: usize,
    checkpoint_interval: usize,
    batches_since_checkpoint: usize,
    pending_records: u64,
    pending_cursor: Option<String>,
    finished: bool,
}

impl<T: SyncItem> BatchWalk<T> {
    async fn advance(&mut self) -> Option<StoreResult<Vec<T>>> {
        if self.finished {
            return None;
        }

        let exhausted = self.remaining.as_slice().is_empty();
        if self.pending_records > 0
            && (exhausted || self.batches_since_checkpoint >= self.checkpoint_interval)
        {
            if let Err(err) = self.flush().await {
                self.finished = true;
                return Some(Err(err));
            }
        }

        if exhausted {
            self.finished = true;
            return None;
        }

        match self.manager.get(&self.checkpoint_id).await {
            Ok(checkpoint) => match checkpoint.status {
                CheckpointStatus::InProgress => {}
                CheckpointStatus::Paused => {
                    info!(checkpoint_id = %self.checkpoint_id, "sync paused, stopping batch walk");
                    self.finished = true;
                    if self.pending_records > 0
                        && let Err(err) = self.flush().await
                    {
                        return Some(Err(err));
                    }
                    return None;
                }
                other => {
                    self.finished = true;
                    return Some(Err(StoreError::CheckpointFinalized {
                        id: self.checkpoint_id.clone(),
                        status: other.to_string(),
                    }));
                }
            },
            Err(err) => {
                self.finished = true;
                return Some(Err(err));
            }
        }

        let batch: Vec<T> = self.remaining.by_ref().take(self.batch_size).collect();
        if let Some(cursor) = batch.last().and_then(SyncItem::sync_id) {
            self.pending_cursor = Some(cursor);
        }
        self.pending_records += batch.len() as u64;
        self.batches_since_checkpoint += 1;

        Some(Ok(batch))
    }

    async fn flush(&mut self) -> StoreResult<()> {
        self.manager
            .update_progress(
                &self.checkpoint_id,
                self.pending_cursor.as_deref(),
                self.pending_records,
                0,
            )
            .await?;
        self.pending_records = 0;
        self.pending_cursor = None;
        self.batches_since_checkpoint = 0;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

fn fetch(conn: &Connection, id: &str) -> StoreResult<Option<SyncCheckpoint>> {
    let sql = format!("SELECT {CHECKPOINT_COLUMNS} FROM sync_checkpoints WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], map_checkpoint_row)
        .optional()?)
}

fn current_status(conn: &Connection, id: &str) -> StoreResult<Option<CheckpointStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM sync_checkpoints WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.as_deref().and_then(CheckpointStatus::parse))
}

/// Explain why an update matched no rows.
fn not_mutable(conn: &Connection, id: &str) -> StoreResult<StoreError> {
    Ok(match current_status(conn, id)? {
        None => StoreError::CheckpointNotFound { id: id.to_string() },
        Some(status) => StoreError::CheckpointFinalized {
            id: id.to_string(),
            status: status.to_string(),
        },
    })
}

fn map_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncCheckpoint> {
    let status: String = row.get(8)?;
    Ok(SyncCheckpoint {
        id: row.get(0)?,
        integration: row.get(1)?,
        sync_type: row.get(2)?,
        last_processed_id: row.get(3)?,
        last_processed_at: row
            .get::<_, Option<i64>>(4)?
            .and_then(DateTime::from_timestamp_millis),
        total_records: from_sql_count(row.get(5)?),
        processed_records: from_sql_count(row.get(6)?),
        failed_records: from_sql_count(row.get(7)?),
        status: CheckpointStatus::parse(&status).unwrap_or(CheckpointStatus::Failed),
        error_message: row.get(9)?,
        created_at: DateTime::from_timestamp_millis(row.get(10)?).unwrap_or_default(),
        updated_at: DateTime::from_timestamp_millis(row.get(11)?).unwrap_or_default(),
    })
}

fn to_sql_count(value: u64) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidArgument(format!("record count out of range: {value}")))
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn percentage(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (processed as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
