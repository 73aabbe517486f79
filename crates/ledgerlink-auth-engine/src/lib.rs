//! OAuth engine for LedgerLink.
//!
//! This crate connects LedgerLink to its providers and keeps those
//! connections alive:
//!
//! - **Provider adapters** for QuickBooks and Ramp behind one contract
//! - **Connect flow** with single-use, expiring state tokens
//! - **Token refresh** on demand and from a background sweep, serialized
//!   per provider
//!
//! Tokens are persisted through the encrypted [`ledgerlink_vault`]
//! credential store.
//!
//! # Architecture
//!
//! ```text
//! OAuthFlowManager ──┬── ProviderRegistry ── ProviderAdapter (QuickBooks, Ramp)
//!                    ├── StateStore        (memory or SQLite)
//!                    └── CredentialStore
//!
//! RefreshScheduler ──── TokenRefresher ──┬── ProviderRegistry
//!                                        └── CredentialStore
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledgerlink_auth_engine::providers::ramp;
//! use ledgerlink_auth_engine::{
//!     OAuthFlowManager, Provider, ProviderCredentials, ProviderRegistry, SqliteStateStore,
//!     SystemClock,
//! };
//! use ledgerlink_store::Database;
//! use ledgerlink_vault::{Cipher, CredentialStore, SqliteAuditLog};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open_and_migrate("data/ledgerlink.db").await?;
//! let credentials = CredentialStore::new(
//!     db.clone(),
//!     Arc::new(Cipher::new("application-secret")?),
//!     Arc::new(SqliteAuditLog::new(db.clone())),
//! );
//! let registry = ProviderRegistry::new().with(Arc::new(ramp::adapter(ProviderCredentials {
//!     client_id: "client".into(),
//!     client_secret: "secret".into(),
//!     redirect_uri: "http://localhost:8400/callback".into(),
//! })));
//!
//! let flow = OAuthFlowManager::new(
//!     Arc::new(registry),
//!     Arc::new(SqliteStateStore::new(db)),
//!     credentials,
//!     Arc::new(SystemClock),
//! );
//! let request = flow.initiate(Provider::Ramp).await?;
//! println!("visit {}", request.auth_url);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod flow;
pub mod providers;
pub mod refresh;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AuthEngineError, Result};
pub use flow::{AuthorizationRequest, OAuthFlowManager};
pub use providers::{
    Provider, ProviderAdapter, ProviderCredentials, ProviderDescriptor, ProviderRegistry,
    StandardOAuthAdapter, TokenSet,
};
pub use refresh::{RefreshSettings, TokenProvider, TokenRefresher};
pub use scheduler::{RefreshScheduler, SweepReport};
pub use state::{MemoryStateStore, OAuthState, SqliteStateStore, StateStore};
