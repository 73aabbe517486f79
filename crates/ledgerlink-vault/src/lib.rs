//! Encrypted credential vault for LedgerLink.
//!
//! This crate holds everything LedgerLink trusts about its provider
//! connections. OAuth tokens are encrypted at rest with AES-256-GCM under a
//! key derived from the application secret, and every lifecycle event is
//! reported to an audit sink.
//!
//! # Modules
//!
//! - [`crypto`]: AES-256-GCM `Cipher`, state token generation, constant-time compare.
//! - [`store`]: SQLite-backed encrypted credential store.
//! - [`audit`]: Audit sink trait and the SQLite audit log.
//! - [`error`]: Unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledgerlink_store::Database;
//! use ledgerlink_vault::{Cipher, CredentialStore, SqliteAuditLog, StoredTokens};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open_and_migrate("data/ledgerlink.db").await?;
//! let cipher = Arc::new(Cipher::new("application-secret")?);
//! let audit = Arc::new(SqliteAuditLog::new(db.clone()));
//! let credentials = CredentialStore::new(db, cipher, audit);
//!
//! let tokens = StoredTokens {
//!     access_token: "access".into(),
//!     refresh_token: Some("refresh".into()),
//!     ..Default::default()
//! };
//! credentials.store_credentials("ramp", &tokens).await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod crypto;
pub mod error;
pub mod store;

// Re-export the most commonly used types at the crate root for convenience.
pub use audit::{AuditAction, AuditEntry, AuditSink, SqliteAuditLog, record_best_effort};
pub use crypto::{Cipher, generate_state_token, secure_compare};
pub use error::{Result, VaultError};
pub use store::{
    CredentialStatus, CredentialStore, CredentialSummary, IntegrationCredential,
    RefreshCandidate, StoredTokens,
};
