//! # ledgerlink-store
//!
//! Storage engine for LedgerLink.
//!
//! Provides the shared SQLite handle (WAL mode, versioned migrations) used
//! by every other crate, and the sync checkpoint manager that makes bulk
//! provider synchronizations resumable.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  SyncCheckpointManager (progress + cursor)   │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)     │
//! │  Migrations (versioned, transactional)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use ledgerlink_store::{Database, SyncCheckpointManager};
//!
//! let db = Database::open_and_migrate("data/ledgerlink.db").await?;
//! let checkpoints = SyncCheckpointManager::new(db.clone());
//! let (checkpoint, cursor) = checkpoints.resume_or_create("quickbooks", "bills", 500).await?;
//! ```

pub mod checkpoint;
pub mod db;
pub mod error;
pub mod migration;

// ── re-exports ───────────────────────────────────────────────────────

pub use checkpoint::{
    CheckpointStatus, SyncCheckpoint, SyncCheckpointManager, SyncItem, SyncProgress,
};
pub use db::Database;
pub use error::{StoreError, StoreResult};
