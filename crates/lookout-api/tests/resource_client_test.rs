// Integration tests for `ResourceClient` + `CredentialProvider` using wiremock.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lookout_api::auth::TOKEN_STORAGE_KEY;
use lookout_api::{
    CredentialProvider, Error, FetchOptions, MemorySessionStorage, QueryParams, ResourceClient,
    SessionStorage,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup(token: Option<&str>) -> (MockServer, Arc<ResourceClient>, Arc<MemorySessionStorage>) {
    let server = MockServer::start().await;
    let root: url::Url = format!("{}/api", server.uri()).parse().unwrap();

    let storage = Arc::new(MemorySessionStorage::new());
    if let Some(token) = token {
        storage.set(TOKEN_STORAGE_KEY, token.to_owned());
    }

    let http = reqwest::Client::new();
    let credentials =
        CredentialProvider::new(http.clone(), &root, storage.clone() as Arc<dyn SessionStorage>)
            .unwrap();
    let client = ResourceClient::new(http, root, Arc::new(credentials));
    (server, Arc::new(client), storage)
}

async fn fetch(client: &ResourceClient, resource: &str) -> Result<serde_json::Value, Error> {
    client
        .get_json(
            resource,
            &QueryParams::new(),
            &FetchOptions::default(),
            &CancellationToken::new(),
        )
        .await
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_sends_bearer_and_query() {
    let (server, client, _) = setup(Some("tok-1")).await;

    Mock::given(method("GET"))
        .and(path("/api/accounts/1/values"))
        .and(query_param("p", "cpu.load"))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "paths": { "cpu.load": [] } })))
        .expect(1)
        .mount(&server)
        .await;

    let mut query = QueryParams::new();
    query.insert("p".into(), "cpu.load".into());
    let value = client
        .get_json(
            "accounts/1/values",
            &query,
            &FetchOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(value, json!({ "paths": { "cpu.load": [] } }));
}

#[tokio::test]
async fn test_fetch_sends_extra_headers() {
    let (server, client, _) = setup(Some("tok-1")).await;

    Mock::given(method("GET"))
        .and(path("/api/accounts/1/entities"))
        .and(header("X-Request-Source", "dashboard"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "list": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let mut options = FetchOptions::default();
    options
        .headers
        .insert("X-Request-Source", "dashboard".parse().unwrap());

    client
        .get_json(
            "accounts/1/entities",
            &QueryParams::new(),
            &options,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
}

// ── Token refresh ───────────────────────────────────────────────────

#[tokio::test]
async fn test_401_refreshes_and_retries_once() {
    let (server, client, storage) = setup(Some("old")).await;

    Mock::given(method("GET"))
        .and(path("/api/accounts/1"))
        .and(header("Authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(header("Authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(200).insert_header("X-JWT-Token", "new"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/accounts/1"))
        .and(header("Authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let value = fetch(&client, "accounts/1").await.unwrap();

    assert_eq!(value, json!({ "id": 1 }));
    assert_eq!(storage.get(TOKEN_STORAGE_KEY).as_deref(), Some("new"));
}

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let (server, client, _) = setup(Some("old")).await;

    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-JWT-Token", "new")
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(3)
        .mount(&server)
        .await;

    let (a, b, c) = tokio::join!(
        fetch(&client, "accounts/1/entities"),
        fetch(&client, "accounts/1/dashboards"),
        fetch(&client, "accounts/1/values"),
    );

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    // `.expect(1)` on the refresh mock is verified when `server` drops.
}

#[tokio::test]
async fn test_second_401_is_session_expired() {
    let (server, client, _) = setup(Some("old")).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).insert_header("X-JWT-Token", "new"))
        .mount(&server)
        .await;

    let err = fetch(&client, "accounts/1").await.unwrap_err();

    assert!(matches!(err, Error::SessionExpired), "got {err:?}");
    assert!(err.is_auth_expired());
}

#[tokio::test]
async fn test_failed_refresh_is_auth_error() {
    let (server, client, storage) = setup(Some("old")).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = fetch(&client, "accounts/1").await.unwrap_err();

    assert!(matches!(err, Error::Authentication { .. }), "got {err:?}");
    assert!(err.is_auth_expired());
    assert_eq!(storage.get(TOKEN_STORAGE_KEY).as_deref(), Some("old"));
}

#[tokio::test]
async fn test_refresh_without_token_header_is_auth_error() {
    let (server, client, _) = setup(Some("old")).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let err = fetch(&client, "accounts/1").await.unwrap_err();
    assert!(matches!(err, Error::Authentication { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_refresh_reuses_already_rotated_token() {
    let (server, client, storage) = setup(Some("new")).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let fresh = client
        .credentials()
        .refresh(&SecretString::from("old"))
        .await
        .unwrap();

    assert_eq!(fresh.expose_secret(), "new");
    assert_eq!(storage.get(TOKEN_STORAGE_KEY).as_deref(), Some("new"));
}

// ── Error paths ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_token_is_not_authenticated() {
    let (server, client, _) = setup(None).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = fetch(&client, "accounts/1").await.unwrap_err();
    assert!(matches!(err, Error::NotAuthenticated), "got {err:?}");
}

#[tokio::test]
async fn test_non_success_carries_status_text() {
    let (server, client, _) = setup(Some("tok")).await;

    Mock::given(method("GET"))
        .and(path("/api/accounts/9"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = fetch(&client, "accounts/9").await.unwrap_err();

    assert_eq!(err.status(), Some(404));
    assert_eq!(err.to_string(), "Not Found");
}

#[tokio::test]
async fn test_invalid_json_is_deserialization_error() {
    let (server, client, _) = setup(Some("tok")).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = fetch(&client, "accounts/1").await.unwrap_err();
    match err {
        Error::Deserialization { body, .. } => assert_eq!(body, "<html>oops</html>"),
        other => panic!("expected Deserialization, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_aborts_in_flight_fetch() {
    let (server, client, _) = setup(Some("tok")).await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = client
        .get_json(
            "accounts/1",
            &QueryParams::new(),
            &FetchOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}
