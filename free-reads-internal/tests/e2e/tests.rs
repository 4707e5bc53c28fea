//! Tests against a live Redis. Run with `FREE_READS_REDIS_URL` set and `--features e2e_tests`.

use std::sync::Arc;
use std::time::Duration;

use free_reads_internal::config::{QuotaConfig, REDIS_URL_ENV_VAR};
use free_reads_internal::gateway_util::redis_url_from_env;
use free_reads_internal::quota::{
    BackendKind, QuotaBackend, QuotaDecision, RedisQuotaStore, SystemClock,
};
use secrecy::{ExposeSecret, SecretString};

fn redis_url() -> SecretString {
    redis_url_from_env()
        .unwrap_or_else(|| panic!("{REDIS_URL_ENV_VAR} must be set to run the e2e tests"))
}

/// Each test writes under its own prefix so runs never see each other's keys
fn quota_config(test_name: &str) -> QuotaConfig {
    QuotaConfig {
        key_prefix: format!(
            "free-e2e-{test_name}-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ),
        ..Default::default()
    }
}

async fn store(config: &QuotaConfig) -> RedisQuotaStore {
    RedisQuotaStore::connect(&redis_url(), config, Arc::new(SystemClock))
        .await
        .unwrap()
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(redis_url().expose_secret())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_redis_scenario() {
    let store = store(&quota_config("scenario")).await;
    assert_eq!(store.kind(), BackendKind::Redis);
    store.health_check().await.unwrap();

    let initial = store.inspect("u").await.unwrap();
    assert_eq!(initial.remaining, 2);
    assert!(initial.consumed.is_empty());

    let first = store.consume("u", "docA").await.unwrap();
    assert!(matches!(first, QuotaDecision::Allow { charged: true, .. }));
    assert_eq!(first.remaining(), 1);

    let repeat = store.consume("u", "docA").await.unwrap();
    assert!(matches!(repeat, QuotaDecision::Allow { charged: false, .. }));
    assert_eq!(repeat.remaining(), 1);

    assert_eq!(store.consume("u", "docB").await.unwrap().remaining(), 0);
    assert!(!store.consume("u", "docC").await.unwrap().is_allowed());

    let snapshot = store.inspect("u").await.unwrap();
    assert_eq!(snapshot.consumed, vec!["docA", "docB"]);

    let reset = store.reset("u").await.unwrap();
    assert_eq!(reset.remaining, 2);
    assert!(store.inspect("u").await.unwrap().consumed.is_empty());
    assert!(matches!(
        store.consume("u", "docA").await.unwrap(),
        QuotaDecision::Allow { charged: true, .. }
    ));
}

#[tokio::test]
async fn test_redis_seed_keeps_consumed() {
    let store = store(&quota_config("seed")).await;
    store.consume("u", "docA").await.unwrap();

    let seeded = store.seed("u", 5).await.unwrap();
    assert_eq!(seeded.remaining, 5);
    assert_eq!(seeded.consumed, vec!["docA"]);
    assert_eq!(store.consume("u", "docA").await.unwrap().remaining(), 5);
    assert_eq!(store.consume("u", "docB").await.unwrap().remaining(), 4);
}

#[tokio::test]
async fn test_redis_keys_expire_with_window() {
    let config = QuotaConfig {
        window_ms: 500,
        ..quota_config("expiry")
    };
    let store = store(&config).await;
    store.consume("u", "docA").await.unwrap();
    store.consume("u", "docB").await.unwrap();
    assert!(!store.consume("u", "docC").await.unwrap().is_allowed());

    tokio::time::sleep(Duration::from_millis(800)).await;

    let decision = store.consume("u", "docA").await.unwrap();
    assert!(matches!(decision, QuotaDecision::Allow { charged: true, .. }));
    assert_eq!(decision.remaining(), 1);
}

#[tokio::test]
async fn test_redis_recovers_from_invalid_counter() {
    let config = quota_config("invalid");
    let store = store(&config).await;
    store.consume("u", "docA").await.unwrap();

    let mut conn = raw_connection().await;
    let _: () = redis::cmd("SET")
        .arg(format!("{}:u:remaining", config.key_prefix))
        .arg(-5)
        .query_async(&mut conn)
        .await
        .unwrap();

    let snapshot = store.inspect("u").await.unwrap();
    assert_eq!(snapshot.remaining, 2);
    assert!(snapshot.consumed.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_concurrent_consume_never_overshoots() {
    let store = Arc::new(store(&quota_config("concurrent")).await);

    let tasks = (0..50).map(|i| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.consume("u", &format!("doc{i}")).await })
    });
    let results = futures::future::join_all(tasks).await;

    let granted = results
        .into_iter()
        .filter(|r| r.as_ref().unwrap().as_ref().unwrap().is_allowed())
        .count();
    assert_eq!(granted, 2);
    assert_eq!(store.inspect("u").await.unwrap().consumed.len(), 2);
}
