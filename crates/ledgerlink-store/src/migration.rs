//! Versioned schema.
//!
//! Applied versions are recorded in `_migrations`; each one runs once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    /// One or more `;`-separated statements.
    sql: &'static str,
}

/// Append only; versions strictly increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "integration credentials, oauth states and audit log",
        sql: r#"
            CREATE TABLE integration_credentials (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                provider                TEXT NOT NULL UNIQUE,
                access_token_encrypted  TEXT,
                refresh_token_encrypted TEXT,
                token_expires_at        INTEGER,
                config                  TEXT NOT NULL DEFAULT '{}',
                status                  TEXT NOT NULL CHECK(status IN ('active','error','expired','disconnected')),
                last_error              TEXT,
                version                 INTEGER NOT NULL DEFAULT 0,
                created_at              INTEGER NOT NULL,
                updated_at              INTEGER NOT NULL
            );
            CREATE INDEX idx_credentials_status_expiry
                ON integration_credentials(status, token_expires_at);

            CREATE TABLE oauth_states (
                state_token TEXT PRIMARY KEY,
                provider    TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_oauth_states_expiry ON oauth_states(expires_at);

            CREATE TABLE audit_log (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                provider  TEXT NOT NULL,
                action    TEXT NOT NULL,
                detail    TEXT,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX idx_audit_timestamp ON audit_log(timestamp);
        "#,
    },
    Migration {
        version: 2,
        description: "sync checkpoints for resumable batch synchronizations",
        sql: r#"
            CREATE TABLE sync_checkpoints (
                id                TEXT PRIMARY KEY,
                integration_type  TEXT NOT NULL,
                sync_type         TEXT NOT NULL,
                last_processed_id TEXT,
                last_processed_at INTEGER,
                total_records     INTEGER NOT NULL DEFAULT 0,
                processed_records INTEGER NOT NULL DEFAULT 0,
                failed_records    INTEGER NOT NULL DEFAULT 0,
                status            TEXT NOT NULL CHECK(status IN ('in_progress','completed','failed','paused')),
                error_message     TEXT,
                created_at        INTEGER NOT NULL,
                updated_at        INTEGER NOT NULL
            );
            CREATE INDEX idx_sync_checkpoints_lookup
                ON sync_checkpoints(integration_type, sync_type, status, created_at);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Bring the schema at `conn` up to the newest version. Blocking.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(failed(0, "create _migrations"))?;

    let current = current_version(conn)?;
    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = current, "schema up to date");
    } else {
        info!(from = current, applied, "schema migrated");
    }
    Ok(())
}

/// Highest applied migration version, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(failed(0, "read schema version"))
}

// ── internals ────────────────────────────────────────────────────────

fn failed(version: u32, step: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| StoreError::Migration {
        version,
        message: format!("{step}: {e}"),
    }
}

/// Apply one migration and record it, atomically.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let version = migration.version;
    info!(version, description = migration.description, "applying migration");

    // `Connection::transaction` needs `&mut`, so BEGIN/COMMIT by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(failed(version, "begin"))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(failed(version, "execute"))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![version, migration.description, chrono::Utc::now().timestamp()],
            )
            .map(|_| ())
            .map_err(failed(version, "record"))
        });

    match result {
        Ok(()) => conn.execute_batch("COMMIT;").map_err(failed(version, "commit")),
        Err(err) => {
            warn!(version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
