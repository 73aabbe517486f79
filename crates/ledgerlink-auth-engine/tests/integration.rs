//! Integration tests for the ledgerlink-auth-engine crate.
//!
//! Real provider adapters talk to a wiremock authorization server; tokens
//! land in an encrypted credential store, mostly over in-memory SQLite.

use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::Duration;
use ledgerlink_auth_engine::providers::{quickbooks, ramp};
use ledgerlink_auth_engine::{
    AuthEngineError, ManualClock, OAuthFlowManager, Provider, ProviderCredentials,
    ProviderDescriptor, ProviderRegistry, RefreshScheduler, SqliteStateStore,
    StandardOAuthAdapter, TokenRefresher,
};
use ledgerlink_store::Database;
use ledgerlink_vault::{AuditAction, Cipher, CredentialStatus, CredentialStore, SqliteAuditLog};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Env {
    db: Database,
    registry: Arc<ProviderRegistry>,
    credentials: CredentialStore,
    audit: Arc<SqliteAuditLog>,
    clock: Arc<ManualClock>,
}

fn point_at(mut descriptor: ProviderDescriptor, server: &MockServer) -> ProviderDescriptor {
    let base = server.uri();
    let name = descriptor.provider.as_str();
    descriptor.authorize_url = format!("{base}/{name}/authorize");
    descriptor.token_url = format!("{base}/{name}/token");
    descriptor.revoke_url = format!("{base}/{name}/revoke");
    descriptor.api_base_url = format!("{base}/{name}/api");
    descriptor
}

fn client_credentials() -> ProviderCredentials {
    ProviderCredentials {
        client_id: "ledgerlink".to_string(),
        client_secret: "client-secret".to_string(),
        redirect_uri: "http://127.0.0.1:8400/callback".to_string(),
    }
}

async fn env(server: &MockServer) -> Env {
    let db = Database::in_memory_migrated().await.unwrap();
    let audit = Arc::new(SqliteAuditLog::new(db.clone()));
    let cipher = Cipher::with_iterations("integration", NonZeroU32::new(1).unwrap()).unwrap();
    let credentials = CredentialStore::new(db.clone(), Arc::new(cipher), audit.clone());

    let registry = ProviderRegistry::new()
        .with(Arc::new(StandardOAuthAdapter::new(
            point_at(
                quickbooks::descriptor(quickbooks::QuickBooksEnvironment::Sandbox),
                server,
            ),
            client_credentials(),
        )))
        .with(Arc::new(StandardOAuthAdapter::new(
            point_at(ramp::descriptor(), server),
            client_credentials(),
        )));

    Env {
        db,
        registry: Arc::new(registry),
        credentials,
        audit,
        clock: Arc::new(ManualClock::default()),
    }
}

fn flow(env: &Env) -> OAuthFlowManager {
    OAuthFlowManager::new(
        env.registry.clone(),
        Arc::new(SqliteStateStore::new(env.db.clone())),
        env.credentials.clone(),
        env.clock.clone(),
    )
}

fn refresher(env: &Env) -> Arc<TokenRefresher> {
    Arc::new(TokenRefresher::new(
        env.registry.clone(),
        env.credentials.clone(),
        env.clock.clone(),
        Duration::minutes(30),
    ))
}

fn token_body(access: &str, refresh: Option<&str>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "access_token": access,
        "expires_in": 3600,
        "token_type": "bearer",
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = serde_json::json!(refresh);
    }
    body
}

fn state_param(auth_url: &str) -> String {
    url::Url::parse(auth_url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

async fn connect(env: &Env, provider: Provider, params: serde_json::Map<String, serde_json::Value>) {
    let flow = flow(env);
    let request = flow.initiate(provider).await.unwrap();
    flow.handle_callback(provider, "auth-code", &request.state, &params)
        .await
        .unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Connect flow
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn state_issued_for_one_provider_is_rejected_for_another() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("x", Some("y"))))
        .expect(0)
        .mount(&server)
        .await;
    let env = env(&server).await;
    let flow = flow(&env);

    let request = flow.initiate(Provider::Ramp).await.unwrap();
    assert_eq!(state_param(&request.auth_url), request.state);

    let err = flow
        .handle_callback(
            Provider::QuickBooks,
            "auth-code",
            &request.state,
            &serde_json::Map::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthEngineError::InvalidState));
    assert!(env.credentials.get_credentials("quickbooks").await.unwrap().is_none());
}

#[tokio::test]
async fn quickbooks_connect_stores_realm_and_audits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/quickbooks/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("qb-at", Some("qb-rt"))))
        .expect(1)
        .mount(&server)
        .await;
    let env = env(&server).await;

    let mut params = serde_json::Map::new();
    params.insert(quickbooks::REALM_ID.into(), serde_json::json!("9130357"));
    connect(&env, Provider::QuickBooks, params).await;

    let stored = env
        .credentials
        .get_credentials("quickbooks")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, CredentialStatus::Active);
    assert_eq!(stored.access_token.as_deref(), Some("qb-at"));
    assert_eq!(stored.refresh_token.as_deref(), Some("qb-rt"));
    assert_eq!(stored.metadata[quickbooks::REALM_ID], "9130357");

    let actions: Vec<AuditAction> = env
        .audit
        .query_recent(Some("quickbooks"), 10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&AuditAction::TokenCreated));
}

#[tokio::test]
async fn state_issued_by_one_instance_verifies_on_another() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ramp/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("r-at", Some("r-rt"))))
        .mount(&server)
        .await;
    let env = env(&server).await;

    let issuer = flow(&env);
    let verifier = flow(&env);

    let request = issuer.initiate(Provider::Ramp).await.unwrap();
    verifier
        .handle_callback(Provider::Ramp, "c", &request.state, &serde_json::Map::new())
        .await
        .unwrap();

    // Single use across instances too.
    let replay = issuer
        .handle_callback(Provider::Ramp, "c", &request.state, &serde_json::Map::new())
        .await;
    assert!(matches!(replay, Err(AuthEngineError::InvalidState)));
}

#[tokio::test]
async fn state_survives_across_database_handles() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ledgerlink.db");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ramp/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("d-at", Some("d-rt"))))
        .expect(1)
        .mount(&server)
        .await;

    let manager_for = |db: Database| {
        let audit = Arc::new(SqliteAuditLog::new(db.clone()));
        let cipher = Cipher::with_iterations("integration", NonZeroU32::new(1).unwrap()).unwrap();
        let registry = ProviderRegistry::new().with(Arc::new(StandardOAuthAdapter::new(
            point_at(ramp::descriptor(), &server),
            client_credentials(),
        )));
        OAuthFlowManager::new(
            Arc::new(registry),
            Arc::new(SqliteStateStore::new(db.clone())),
            CredentialStore::new(db, Arc::new(cipher), audit),
            Arc::new(ManualClock::default()),
        )
    };

    // Separate connections to one file, as two processes would have.
    let first = manager_for(Database::open_and_migrate(db_path.clone()).await.unwrap());
    let request = first.initiate(Provider::Ramp).await.unwrap();

    let second = manager_for(Database::open_and_migrate(db_path.clone()).await.unwrap());
    let tokens = second
        .handle_callback(Provider::Ramp, "c", &request.state, &serde_json::Map::new())
        .await
        .unwrap();
    assert_eq!(tokens.access_token, "d-at");
}

#[tokio::test]
async fn expired_state_is_rejected() {
    let server = MockServer::start().await;
    let env = env(&server).await;
    let flow = flow(&env);

    let request = flow.initiate(Provider::Ramp).await.unwrap();
    env.clock.advance(Duration::minutes(11));

    let err = flow
        .handle_callback(Provider::Ramp, "c", &request.state, &serde_json::Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthEngineError::InvalidState));
}

#[tokio::test]
async fn disconnect_revokes_with_provider_and_clears_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ramp/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("r-at", Some("r-rt"))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ramp/revoke"))
        .and(body_string_contains("token=r-at"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let env = env(&server).await;
    connect(&env, Provider::Ramp, serde_json::Map::new()).await;

    flow(&env).disconnect(Provider::Ramp).await.unwrap();

    let stored = env.credentials.get_credentials("ramp").await.unwrap().unwrap();
    assert_eq!(stored.status, CredentialStatus::Disconnected);
    assert!(stored.access_token.is_none());
}

// ═══════════════════════════════════════════════════════════════════════
//  Refresh
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn refresh_happens_only_inside_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ramp/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", Some("rt-1"))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ramp/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", None)))
        .expect(1)
        .mount(&server)
        .await;
    let env = env(&server).await;
    connect(&env, Provider::Ramp, serde_json::Map::new()).await;
    let refresher = refresher(&env);

    // An hour of validity left: no refresh.
    assert_eq!(refresher.ensure_valid_token(Provider::Ramp).await.unwrap(), "at-1");

    // Under thirty minutes left: refreshed, and the unrotated refresh token kept.
    env.clock.advance(Duration::minutes(31));
    assert_eq!(refresher.ensure_valid_token(Provider::Ramp).await.unwrap(), "at-2");

    let stored = env.credentials.get_credentials("ramp").await.unwrap().unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("rt-1"));
}

#[tokio::test]
async fn scheduler_marks_rejected_refresh_as_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ramp/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", Some("rt-1"))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ramp/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "refresh token revoked",
        })))
        .expect(1)
        .mount(&server)
        .await;
    let env = env(&server).await;
    connect(&env, Provider::Ramp, serde_json::Map::new()).await;

    let scheduler = Arc::new(RefreshScheduler::new(
        refresher(&env),
        std::time::Duration::from_secs(300),
    ));
    env.clock.advance(Duration::minutes(45));

    let report = scheduler.sweep_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.failed, 1);

    let stored = env.credentials.get_credentials("ramp").await.unwrap().unwrap();
    assert_eq!(stored.status, CredentialStatus::Error);
    assert!(stored.last_error.unwrap().contains("invalid_grant"));

    let actions: Vec<AuditAction> = env
        .audit
        .query_recent(Some("ramp"), 20)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&AuditAction::TokenRefreshFailed));

    // Reconnecting returns the credential to active.
    connect(&env, Provider::Ramp, serde_json::Map::new()).await;
    let stored = env.credentials.get_credentials("ramp").await.unwrap().unwrap();
    assert_eq!(stored.status, CredentialStatus::Active);
}
