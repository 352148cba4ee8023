//! End-to-end custody flows against a loopback mock of the service.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use si::custody::CustodyClient;
use si::error::Error;
use si::vault::target::VaultTarget;
use si::vault::{cipher, keys, ops};
use si::Config;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    vault_keys: Mutex<HashMap<(String, String), Value>>,
    objects: Mutex<HashMap<(String, String), (Vec<u8>, i64)>>,
    flaky_hits: AtomicU32,
}

type Shared = Arc<MockState>;

async fn readyz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn whoami() -> impl IntoResponse {
    Json(json!({
        "account_id": "acct_1",
        "account_slug": "acme",
        "token_id": "tok_1",
        "scopes": ["vault:rw", "objects:rw"],
    }))
}

async fn get_vault_key(
    State(state): State<Shared>,
    Path((repo, env)): Path<(String, String)>,
) -> impl IntoResponse {
    let keys = state.vault_keys.lock().unwrap();
    match keys.get(&(repo, env)) {
        Some(material) => (StatusCode::OK, Json(material.clone())),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "vault key not found" })),
        ),
    }
}

async fn put_vault_key(
    State(state): State<Shared>,
    Path((repo, env)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let material = json!({
        "repo": repo,
        "env": env,
        "public_key": body["public_key"],
        "private_key": body["private_key"],
        "backup_private_keys": body.get("backup_private_keys").cloned().unwrap_or(json!([])),
        "updated_at": "2026-08-30T00:00:00Z",
    });
    state
        .vault_keys
        .lock()
        .unwrap()
        .insert((repo, env), material.clone());
    Json(material)
}

async fn put_object(
    State(state): State<Shared>,
    Path((kind, name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut objects = state.objects.lock().unwrap();
    let current = objects
        .get(&(kind.clone(), name.clone()))
        .map_or(0, |(_, rev)| *rev);
    if let Some(expected) = body.get("expected_revision").and_then(Value::as_i64) {
        if expected != current {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "revision conflict",
                    "current_revision": current,
                })),
            );
        }
    }
    let payload = body["payload_base64"].as_str().unwrap_or_default();
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .unwrap_or_default();
    let revision = current + 1;
    objects.insert((kind.clone(), name.clone()), (bytes, revision));
    (
        StatusCode::OK,
        Json(json!({
            "object": { "kind": kind, "name": name, "latest_revision": revision },
            "revision": revision,
        })),
    )
}

async fn get_payload(
    State(state): State<Shared>,
    Path((kind, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let objects = state.objects.lock().unwrap();
    match objects.get(&(kind, name)) {
        Some((bytes, _)) => (StatusCode::OK, bytes.clone()),
        None => (
            StatusCode::NOT_FOUND,
            json!({ "error": "object not found" }).to_string().into_bytes(),
        ),
    }
}

/// whoami that fails twice with 500, then succeeds. Exercises the retry
/// budget.
async fn flaky_whoami(State(state): State<Shared>) -> impl IntoResponse {
    let hit = state.flaky_hits.fetch_add(1, Ordering::SeqCst);
    if hit < 2 {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "transient" })),
        )
    } else {
        (
            StatusCode::OK,
            Json(json!({ "account_id": "acct_1", "account_slug": "acme" })),
        )
    }
}

async fn rate_limited() -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", "0")],
        Json(json!({ "error": "slow down" })),
    )
}

async fn unauthorized() -> impl IntoResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "bad token" })),
    )
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_mock() -> (SocketAddr, Shared) {
    let state: Shared = Arc::new(MockState::default());
    let app = Router::new()
        .route("/v1/readyz", get(readyz))
        .route("/v1/auth/whoami", get(whoami))
        .route(
            "/v1/vault/private-keys/{repo}/{env}",
            get(get_vault_key).put(put_vault_key),
        )
        .route("/v1/objects/{kind}/{name}", put(put_object))
        .route("/v1/objects/{kind}/{name}/payload", get(get_payload))
        .with_state(state.clone());
    (serve(app).await, state)
}

fn client(addr: SocketAddr) -> CustodyClient {
    CustodyClient::new(
        &format!("http://{addr}"),
        "tok_test",
        Duration::from_secs(5),
        true,
    )
    .unwrap()
}

fn target(repo: &str) -> VaultTarget {
    VaultTarget {
        repo: repo.to_string(),
        env: "dev".to_string(),
        env_file: PathBuf::from("/work/.env"),
        repo_dir: PathBuf::from("/work"),
    }
}

#[tokio::test]
async fn ready_and_whoami() {
    let (addr, _state) = start_mock().await;
    let custody = client(addr);
    custody.ready().await.unwrap();
    let who = custody.whoami().await.unwrap();
    assert_eq!(who.account_slug, "acme");
    assert_eq!(who.scopes, ["vault:rw", "objects:rw"]);
}

#[tokio::test]
async fn bootstrap_generates_and_uploads_key_material() {
    let (addr, state) = start_mock().await;
    let custody = client(addr);
    let tgt = target("bootstrap-repo");

    let material = keys::ensure(&custody, &tgt, None).await.unwrap();
    assert_eq!(material.repo, "bootstrap-repo");
    assert_eq!(material.env, "dev");
    assert_eq!(material.public_key.len(), 66);
    assert_eq!(material.private_key.len(), 64);

    // The generated pair landed in custody.
    let stored = state
        .vault_keys
        .lock()
        .unwrap()
        .get(&("bootstrap-repo".to_string(), "dev".to_string()))
        .cloned()
        .unwrap();
    assert_eq!(stored["public_key"], material.public_key.as_str());

    // A second ensure returns the same material.
    let again = keys::ensure(&custody, &tgt, None).await.unwrap();
    assert_eq!(again.public_key, material.public_key);
}

fn config(addr: SocketAddr, state_dir: &std::path::Path) -> Config {
    Config {
        custody_base_url: Some(format!("http://{addr}")),
        custody_token: Some("tok_test".to_string()),
        allow_insecure_http: true,
        state_dir: Some(state_dir.to_path_buf()),
        ..Config::default()
    }
}

#[tokio::test]
async fn keypair_bootstraps_and_stamps_header() {
    let (addr, state) = start_mock().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let env_file = tmp.path().join(".env");
    std::fs::write(&env_file, "").unwrap();
    let cfg = config(addr, &tmp.path().join("state"));
    let tgt = VaultTarget {
        repo: "keypair-repo".to_string(),
        env: "dev".to_string(),
        env_file: env_file.clone(),
        repo_dir: tmp.path().to_path_buf(),
    };

    let report = ops::keypair(&cfg, &tgt, false).await.unwrap();
    assert_eq!(report.public_key.len(), 66);
    assert!(!report.rotated);
    assert_eq!(report.backup_keys, 0);

    // The empty file becomes header plus exactly one blank line.
    let written = std::fs::read_to_string(&env_file).unwrap();
    assert_eq!(
        written,
        format!("SI_VAULT_PUBLIC_KEY={}\n\n", report.public_key)
    );

    // Custody holds the matching material; the scalar is not in the report.
    let stored = state
        .vault_keys
        .lock()
        .unwrap()
        .get(&("keypair-repo".to_string(), "dev".to_string()))
        .cloned()
        .unwrap();
    assert_eq!(stored["public_key"], report.public_key.as_str());
    let dump = serde_json::to_string(&report).unwrap();
    assert!(!dump.contains(stored["private_key"].as_str().unwrap()));
}

#[tokio::test]
async fn keypair_rotate_keeps_previous_key_decryptable() {
    let (addr, _state) = start_mock().await;
    let custody = client(addr);
    let tmp = tempfile::TempDir::new().unwrap();
    let env_file = tmp.path().join(".env");
    std::fs::write(&env_file, "").unwrap();
    let cfg = config(addr, &tmp.path().join("state"));
    let tgt = VaultTarget {
        repo: "rotate-repo".to_string(),
        env: "dev".to_string(),
        env_file: env_file.clone(),
        repo_dir: tmp.path().to_path_buf(),
    };

    let original = keys::ensure(&custody, &tgt, None).await.unwrap();
    let sealed = cipher::encrypt("survives-rotation", &original.public_key).unwrap();

    let report = ops::keypair(&cfg, &tgt, true).await.unwrap();
    assert!(report.rotated);
    assert_ne!(report.public_key, original.public_key);
    assert_eq!(report.backup_keys, 1);

    // The rotated material decrypts values sealed to the old key.
    let rotated = keys::ensure(&custody, &tgt, None).await.unwrap();
    assert!(rotated
        .backup_private_keys
        .contains(&original.private_key));
    let plain = cipher::decrypt(&sealed, &rotated.candidates()).unwrap();
    assert_eq!(plain, "survives-rotation");

    // The header follows the new key.
    let written = std::fs::read_to_string(&env_file).unwrap();
    assert!(written.starts_with(&format!("SI_VAULT_PUBLIC_KEY={}\n", report.public_key)));
}

#[tokio::test]
async fn ensure_rejects_mismatched_public_key_hint() {
    let (addr, _state) = start_mock().await;
    let custody = client(addr);
    let tgt = target("hinted-repo");

    keys::ensure(&custody, &tgt, None).await.unwrap();
    let err = keys::ensure(&custody, &tgt, Some("02deadbeef"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");
}

#[tokio::test]
async fn optimistic_lock_conflict_maps_to_version_conflict() {
    let (addr, _state) = start_mock().await;
    let custody = client(addr);

    let first = custody
        .put_object("snapshot", "acme", b"v1", "application/json", None)
        .await
        .unwrap();
    assert_eq!(first.revision, 1);
    let second = custody
        .put_object("snapshot", "acme", b"v2", "application/json", Some(1))
        .await
        .unwrap();
    assert_eq!(second.revision, 2);

    // Stale writer still expects revision 1.
    let err = custody
        .put_object("snapshot", "acme", b"v3", "application/json", Some(1))
        .await
        .unwrap_err();
    match err {
        Error::VersionConflict { expected, current } => {
            assert_eq!(expected, 1);
            assert_eq!(current, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.exit_code(), 4);

    let payload = custody.get_payload("snapshot", "acme").await.unwrap();
    assert_eq!(payload, b"v2", "conflicting write must not land");
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let state: Shared = Arc::new(MockState::default());
    let app = Router::new()
        .route("/v1/auth/whoami", get(flaky_whoami))
        .with_state(state.clone());
    let custody = client(serve(app).await);

    let who = custody.whoami().await.unwrap();
    assert_eq!(who.account_slug, "acme");
    assert_eq!(state.flaky_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limit_exhausts_retry_budget() {
    let app = Router::new().route("/v1/readyz", get(rate_limited));
    let custody = client(serve(app).await);

    let err = custody.ready().await.unwrap_err();
    match err {
        Error::RateLimited {
            attempts,
            retry_after,
        } => {
            assert_eq!(attempts, 4, "3 retries after the first attempt");
            assert_eq!(retry_after, Some(Duration::from_secs(0)));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn unauthorized_is_terminal() {
    let app = Router::new().route("/v1/readyz", get(unauthorized));
    let custody = client(serve(app).await);

    let err = custody.ready().await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)), "{err:?}");
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn missing_object_is_remote_not_found() {
    let (addr, _state) = start_mock().await;
    let custody = client(addr);
    let err = custody
        .get_payload("snapshot", "nothing-here")
        .await
        .unwrap_err();
    match err {
        Error::NotFound { remote, .. } => assert!(remote),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.exit_code(), 2);
}
