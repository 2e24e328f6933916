use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use k256::ecdsa::SigningKey;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use vaultchain::config::Config;
use vaultchain::db::Database;
use vaultchain::ledger::{format_address, public_key_address, InMemoryLedger};
use vaultchain::services::auth::sign_message;
use vaultchain::services::reconcile::{sign_payload, SIGNATURE_HEADER};
use vaultchain::services::ActionMessage;
use vaultchain::storage::StorageManager;
use vaultchain::{create_router, AppState};

const WEBHOOK_SECRET: &str = "indexer-secret";

struct TestApp {
    router: Router,
    state: AppState,
    ledger: Arc<InMemoryLedger>,
    _dir: tempfile::TempDir,
}

struct Wallet {
    key: SigningKey,
    address: String,
}

impl Wallet {
    fn new(seed: u8) -> Self {
        let key = SigningKey::from_slice(&[seed; 32]).unwrap();
        let address = format_address(&public_key_address(key.verifying_key()));
        Self { key, address }
    }

    fn sign(&self, action: ActionMessage<'_>) -> String {
        sign_message(&self.key, &action.to_bytes()).unwrap()
    }
}

async fn app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.local_path = dir.path().to_string_lossy().into_owned();
    config.webhook.secret = WEBHOOK_SECRET.to_string();
    config.rewards.auto_claim = false;
    config.settlement.initial_backoff_ms = 1;
    config.settlement.max_backoff_ms = 5;
    configure(&mut config);

    let ledger = Arc::new(InMemoryLedger::new(config.rewards.schedule()));
    let storage = StorageManager::from_config(&config.storage);
    let db = Database::in_memory().await.unwrap();
    let state = AppState::new(db, config, storage, ledger.clone());

    TestApp {
        router: create_router(state.clone()),
        state,
        ledger,
        _dir: dir,
    }
}

async fn app() -> TestApp {
    app_with(|_| {}).await
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn upload(app: &TestApp, wallet: &Wallet, data: &[u8], encrypt: bool) -> String {
    let signature = wallet.sign(ActionMessage::Upload {
        file_name: "report.pdf",
        payload: data,
    });
    let (status, body) = send(
        app,
        post_json(
            "/api/v1/upload",
            json!({
                "file": STANDARD.encode(data),
                "file_name": "report.pdf",
                "content_type": "application/pdf",
                "should_encrypt": encrypt,
                "user_address": wallet.address,
                "signature": signature,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "pending");
    body["data"]["cid"].as_str().unwrap().to_string()
}

async fn retrieve(app: &TestApp, wallet: &Wallet, cid: &str) -> (StatusCode, Value) {
    let signature = wallet.sign(ActionMessage::Retrieve { cid });
    send(
        app,
        post_json(
            "/api/v1/retrieve",
            json!({ "cid": cid, "user_address": wallet.address, "signature": signature }),
        ),
    )
    .await
}

#[tokio::test]
async fn test_upload_retrieve_and_share() {
    let app = app().await;
    let alice = Wallet::new(1);
    let bob = Wallet::new(2);

    let cid = upload(&app, &alice, b"quarterly numbers", true).await;
    app.state.ledger.queue.wait_idle().await;

    let (status, body) = retrieve(&app, &alice, &cid).await;
    assert_eq!(status, StatusCode::OK);
    let file = STANDARD.decode(body["data"]["file"].as_str().unwrap()).unwrap();
    assert_eq!(file, b"quarterly numbers");

    let (status, _) = retrieve(&app, &bob, &cid).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let signature = alice.sign(ActionMessage::Grant {
        cid: &cid,
        grantee: &bob.address,
        duration: 3600,
    });
    let (status, body) = send(
        &app,
        post_json(
            "/api/v1/access/grant",
            json!({
                "cid": cid,
                "granter": alice.address,
                "grantee": bob.address,
                "duration": 3600,
                "signature": signature,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    // grantee reads plaintext even though the content is encrypted
    let (status, body) = retrieve(&app, &bob, &cid).await;
    assert_eq!(status, StatusCode::OK);
    let file = STANDARD.decode(body["data"]["file"].as_str().unwrap()).unwrap();
    assert_eq!(file, b"quarterly numbers");

    let (status, body) = send(
        &app,
        get(&format!("/api/v1/access/{}/{}", cid, bob.address)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["has_access"], true);
    assert_eq!(body["data"]["source"], "local_grant");
}

#[tokio::test]
async fn test_signature_for_other_action_is_rejected() {
    let app = app().await;
    let alice = Wallet::new(1);
    let cid = upload(&app, &alice, b"payload", false).await;

    // a claim signature must not open a retrieve
    let signature = alice.sign(ActionMessage::Claim { cid: &cid });
    let (status, body) = send(
        &app,
        post_json(
            "/api/v1/retrieve",
            json!({ "cid": cid, "user_address": alice.address, "signature": signature }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Authentication failed");
}

#[tokio::test]
async fn test_malformed_address_is_bad_request() {
    let app = app().await;
    let (status, _) = send(
        &app,
        post_json(
            "/api/v1/retrieve",
            json!({ "cid": "abc", "user_address": "0x123", "signature": "0x00" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_second_claim_conflicts_without_new_transaction() {
    let app = app().await;
    let alice = Wallet::new(1);
    let cid = upload(&app, &alice, &[7u8; 2048], false).await;
    app.state.ledger.queue.wait_idle().await;

    let claim = |wallet: &Wallet| {
        let signature = wallet.sign(ActionMessage::Claim { cid: &cid });
        post_json(
            "/api/v1/claim-reward",
            json!({ "cid": cid, "user_address": wallet.address, "signature": signature }),
        )
    };

    let (status, body) = send(&app, claim(&alice)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, _) = send(&app, claim(&alice)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(app.ledger.submitted("claim_reward").await, 1);

    let (status, body) = send(&app, get(&format!("/api/v1/files/{}", cid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "rewarded");
}

#[tokio::test]
async fn test_webhook_requires_hmac() {
    let app = app().await;
    let alice = Wallet::new(1);
    let cid = upload(&app, &alice, b"claimed elsewhere", false).await;
    app.state.ledger.queue.wait_idle().await;

    let payload = json!({ "type": "reward_claimed", "cid": cid, "tx_hash": "0xfeed" }).to_string();

    let unsigned = Request::builder()
        .method("POST")
        .uri("/api/v1/webhook")
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signed = || {
        Request::builder()
            .method("POST")
            .uri("/api/v1/webhook")
            .header(SIGNATURE_HEADER, sign_payload(WEBHOOK_SECRET, payload.as_bytes()).unwrap())
            .body(Body::from(payload.clone()))
            .unwrap()
    };
    let (status, body) = send(&app, signed()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], "applied");

    let (status, body) = send(&app, signed()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], "no_op");
}

#[tokio::test]
async fn test_user_listing_and_stats() {
    let app = app().await;
    let alice = Wallet::new(1);
    upload(&app, &alice, b"one", false).await;
    upload(&app, &alice, b"two", true).await;
    app.state.ledger.queue.wait_idle().await;

    let (status, body) = send(
        &app,
        get(&format!(
            "/api/v1/users/{}/files?limit=1&sort=file_size&order=asc",
            alice.address
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["files"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["pagination"]["total"], 2);

    let (status, body) = send(&app, get(&format!("/api/v1/users/{}/stats", alice.address))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_files"], 2);
    assert_eq!(body["data"]["encrypted_files"], 1);

    let (status, _) = send(
        &app,
        get(&format!("/api/v1/users/{}/files?sort=uploader", alice.address)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_settlement_stats() {
    let app = app().await;

    let (status, body) = send(&app, get("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ledger_backend"], "memory");
    assert_eq!(body["data"]["storage_providers"], json!(["local"]));

    let (status, body) = send(&app, get("/api/v1/settlement/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["in_flight"], 0);
}

#[tokio::test]
async fn test_reward_preview() {
    let app = app_with(|config| {
        config.rewards.base_wei = 100;
        config.rewards.size_multiplier_wei = 10;
        config.rewards.encryption_bonus_wei = 5;
    })
    .await;

    let (status, body) = send(&app, get("/api/v1/rewards/preview?size=2048&encrypted=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["amount_wei"], "125");
}

#[tokio::test]
async fn test_rate_limit() {
    let app = app_with(|config| {
        config.rate_limit.requests_per_window = 2;
        config.rate_limit.window_secs = 3600;
    })
    .await;

    assert_eq!(send(&app, get("/api/v1/settlement/stats")).await.0, StatusCode::OK);
    assert_eq!(send(&app, get("/api/v1/settlement/stats")).await.0, StatusCode::OK);
    assert_eq!(
        send(&app, get("/api/v1/settlement/stats")).await.0,
        StatusCode::TOO_MANY_REQUESTS
    );
}
