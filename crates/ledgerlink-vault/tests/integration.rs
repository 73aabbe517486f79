//! Integration tests for the ledgerlink-vault crate.
//!
//! These exercise the credential store against an on-disk database shared
//! by two independently constructed stores, the way the CLI and the refresh
//! daemon share one file.

use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{Duration, Utc};
use ledgerlink_store::Database;
use ledgerlink_vault::{
    AuditAction, Cipher, CredentialStatus, CredentialStore, SqliteAuditLog, StoredTokens,
    VaultError,
};

fn cipher(secret: &str) -> Arc<Cipher> {
    Arc::new(Cipher::with_iterations(secret, NonZeroU32::new(10).unwrap()).unwrap())
}

fn store(db: &Database, secret: &str) -> CredentialStore {
    CredentialStore::new(
        db.clone(),
        cipher(secret),
        Arc::new(SqliteAuditLog::new(db.clone())),
    )
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared database
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_process_with_same_secret_reads_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");

    {
        let db = Database::open_and_migrate(path.clone()).await.unwrap();
        let writer = store(&db, "shared-app-secret");
        let tokens = StoredTokens {
            access_token: "qb-access".into(),
            refresh_token: Some("qb-refresh".into()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            metadata: serde_json::json!({ "realmId": "4620816365" })
                .as_object()
                .cloned()
                .unwrap(),
        };
        writer.store_credentials("quickbooks", &tokens).await.unwrap();
    }

    let db = Database::open_and_migrate(path).await.unwrap();
    let reader = store(&db, "shared-app-secret");
    let cred = reader.get_credentials("quickbooks").await.unwrap().unwrap();
    assert_eq!(cred.access_token.as_deref(), Some("qb-access"));
    assert_eq!(cred.metadata["realmId"], "4620816365");
}

#[tokio::test]
async fn different_secret_cannot_decrypt() {
    let db = Database::in_memory_migrated().await.unwrap();
    store(&db, "secret-one")
        .store_credentials(
            "ramp",
            &StoredTokens {
                access_token: "ramp-access".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = store(&db, "secret-two")
        .get_credentials("ramp")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::DecryptionFailed { .. }));
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_credential_lifecycle() {
    let db = Database::in_memory_migrated().await.unwrap();
    let audit = SqliteAuditLog::new(db.clone());
    let credentials = store(&db, "secret");

    credentials
        .store_credentials(
            "ramp",
            &StoredTokens {
                access_token: "a1".into(),
                refresh_token: Some("r1".into()),
                expires_at: Some(Utc::now() + Duration::minutes(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let due = credentials
        .due_for_refresh(Utc::now(), Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(due.len(), 1);

    credentials.mark_disconnected("ramp").await.unwrap();
    let statuses = credentials.list_statuses().await.unwrap();
    assert_eq!(statuses[0].status, CredentialStatus::Disconnected);
    assert!(credentials
        .due_for_refresh(Utc::now(), Duration::minutes(30))
        .await
        .unwrap()
        .is_empty());

    // Writes are audited by the callers; the store only audits reads.
    assert!(audit.query_recent(Some("ramp"), 10).await.unwrap().is_empty());
    credentials.get_credentials("ramp").await.unwrap();
    let entries = audit.query_recent(Some("ramp"), 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::TokenAccessed);
}
