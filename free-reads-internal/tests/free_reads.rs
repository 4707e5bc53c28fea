use std::net::SocketAddr;
use std::sync::Arc;

use free_reads_internal::config::Config;
use free_reads_internal::endpoints::free_reads::NO_STORE;
use free_reads_internal::gateway_util::{start_free_reads_gateway, ShutdownHandle};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

async fn start_local_gateway() -> (SocketAddr, ShutdownHandle) {
    start_free_reads_gateway(Arc::new(Config::default()), None)
        .await
        .unwrap()
}

async fn post(client: &Client, addr: SocketAddr, body: Value) -> (StatusCode, Value) {
    let response = client
        .post(format!("http://{addr}/api/free-reads"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_free_view_scenario() -> anyhow::Result<()> {
    let (addr, _shutdown) = start_local_gateway().await;
    let client = Client::new();

    let (status, first) = post(&client, addr, json!({"userId": "u", "docId": "docA"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["ok"], true);
    assert_eq!(first["remaining"], 1);
    assert_eq!(first["consumed"], json!(["docA"]));
    assert!(first["expiresAt"].is_i64());

    let (_, repeat) = post(&client, addr, json!({"userId": "u", "docId": "docA"})).await;
    assert_eq!(repeat["ok"], true);
    assert_eq!(repeat["remaining"], 1);

    let (_, second) = post(&client, addr, json!({"userId": "u", "docId": "docB"})).await;
    assert_eq!(second["remaining"], 0);

    let (status, denied) = post(&client, addr, json!({"userId": "u", "docId": "docC"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(denied, json!({"ok": false, "reason": "limit", "remaining": 0}));

    let snapshot: Value = client
        .get(format!("http://{addr}/api/free-reads?userId=u"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(snapshot["remaining"], 0);
    assert_eq!(snapshot["consumed"], json!(["docA", "docB"]));

    let (_, reset) = post(&client, addr, json!({"userId": "u", "action": "reset"})).await;
    assert_eq!(reset["remaining"], 2);
    assert_eq!(reset["consumed"], json!([]));
    Ok(())
}

#[tokio::test]
async fn test_responses_are_not_cacheable() -> anyhow::Result<()> {
    let (addr, _shutdown) = start_local_gateway().await;
    let client = Client::new();

    let inspect = client
        .get(format!("http://{addr}/api/free-reads"))
        .send()
        .await?;
    assert_eq!(inspect.headers()["cache-control"], NO_STORE);

    // Rejections carry the header too
    let rejected = client
        .post(format!("http://{addr}/api/free-reads"))
        .json(&json!({"userId": "u"}))
        .send()
        .await?;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    assert_eq!(rejected.headers()["cache-control"], NO_STORE);
    Ok(())
}

#[tokio::test]
async fn test_invalid_requests() {
    let (addr, _shutdown) = start_local_gateway().await;
    let client = Client::new();

    let (status, missing_doc) = post(&client, addr, json!({"userId": "u"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(missing_doc["error"]["field"], "docId");

    let (status, wrong_type) = post(&client, addr, json!({"userId": 7, "docId": "docA"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(wrong_type["error"]["field"], "userId");

    let (status, bad_action) = post(&client, addr, json!({"action": "delete"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(bad_action["error"]["field"], "action");

    let repeated_user = client
        .get(format!("http://{addr}/api/free-reads?userId=a&userId=b"))
        .send()
        .await
        .unwrap();
    assert_eq!(repeated_user.status(), StatusCode::BAD_REQUEST);
    assert_eq!(repeated_user.headers()["cache-control"], NO_STORE);
    let repeated_user: Value = repeated_user.json().await.unwrap();
    assert_eq!(repeated_user["error"]["field"], "userId");

    let malformed = client
        .post(format!("http://{addr}/api/free-reads"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    // Nothing was charged by any of the rejected calls
    let snapshot: Value = client
        .get(format!("http://{addr}/api/free-reads?userId=u"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["remaining"], 2);
}

#[tokio::test]
async fn test_missing_user_id_uses_anonymous_partition() {
    let (addr, _shutdown) = start_local_gateway().await;
    let client = Client::new();

    post(&client, addr, json!({"docId": "docA"})).await;
    post(&client, addr, json!({"userId": "", "docId": "docB"})).await;

    let snapshot: Value = client
        .get(format!("http://{addr}/api/free-reads"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["remaining"], 0);
    assert_eq!(snapshot["consumed"], json!(["docA", "docB"]));
}

#[tokio::test]
async fn test_seed_keeps_history() {
    let (addr, _shutdown) = start_local_gateway().await;
    let client = Client::new();

    post(&client, addr, json!({"userId": "u", "docId": "docA"})).await;
    let (_, seeded) = post(
        &client,
        addr,
        json!({"userId": "u", "action": "seed", "amount": 5}),
    )
    .await;
    assert_eq!(seeded["ok"], true);
    assert_eq!(seeded["remaining"], 5);
    assert_eq!(seeded["consumed"], json!(["docA"]));

    let (_, repeat) = post(&client, addr, json!({"userId": "u", "docId": "docA"})).await;
    assert_eq!(repeat["remaining"], 5);
}

#[tokio::test]
async fn test_concurrent_requests_never_overshoot() {
    let (addr, _shutdown) = start_local_gateway().await;
    let client = Client::new();

    let requests = (0..20).map(|i| {
        let client = client.clone();
        async move { post(&client, addr, json!({"userId": "u", "docId": format!("doc{i}")})).await }
    });
    let responses = futures::future::join_all(requests).await;

    let granted = responses
        .iter()
        .filter(|(_, body)| body["ok"] == true)
        .count();
    assert_eq!(granted, 2);
}

#[tokio::test]
async fn test_health_endpoints_and_fallback() {
    let (addr, _shutdown) = start_local_gateway().await;
    let client = Client::new();

    let ok: Value = client
        .get(format!("http://{addr}/api/ok"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok, json!({"ok": true}));

    let health = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let status: Value = client
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["backend"], "local");

    let missing = client
        .get(format!("http://{addr}/api/favorites"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Route not found: GET /api/favorites");
}
