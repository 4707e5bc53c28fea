use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use axum::routing::get;
use axum::Router;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot::Sender;
use tracing::instrument;

use crate::config::{Config, REDIS_URL_ENV_VAR};
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::quota::{
    Clock, LocalQuotaStore, QuotaBackend, QuotaEngine, RedisQuotaStore, SystemClock,
};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub quota_engine: Arc<QuotaEngine>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    /// Build the state, selecting the quota backend from `FREE_READS_REDIS_URL`
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        Self::new_with_redis_url(config, redis_url_from_env()).await
    }

    pub async fn new_with_redis_url(
        config: Arc<Config>,
        redis_url: Option<SecretString>,
    ) -> Result<Self, Error> {
        let quota_engine = setup_quota_engine(&config, redis_url, Arc::new(SystemClock)).await?;
        Ok(Self {
            config,
            quota_engine: Arc::new(quota_engine),
        })
    }
}

/// Read the durable store URL from the environment. Unset or blank means no durable store.
pub fn redis_url_from_env() -> Option<SecretString> {
    std::env::var(REDIS_URL_ENV_VAR)
        .ok()
        .filter(|url| !url.trim().is_empty())
        .map(SecretString::from)
}

/// Choose the quota backend once for the lifetime of the process.
///
/// With a Redis URL, the durable store is used. If it cannot be reached at startup the gateway
/// runs on the local store instead, unless `quota.redis.required` is set. Once chosen, the
/// backend never changes: runtime Redis failures are reported to callers.
pub async fn setup_quota_engine(
    config: &Config,
    redis_url: Option<SecretString>,
    clock: Arc<dyn Clock>,
) -> Result<QuotaEngine, Error> {
    let quota_config = &config.quota;
    let policy = quota_config.policy();

    let backend: Arc<dyn QuotaBackend> = match redis_url {
        Some(url) => match RedisQuotaStore::connect(&url, quota_config, clock.clone()).await {
            Ok(store) => Arc::new(store),
            Err(e) if quota_config.redis.required => {
                return Err(Error::new(ErrorDetails::AppState {
                    message: format!("Redis quota store is required but unavailable: {e}"),
                }));
            }
            Err(e) => {
                tracing::warn!(
                    "Redis quota store unavailable at startup, using the local store instead. Quotas will not be shared across instances: {e}"
                );
                setup_local_store(config, clock).await
            }
        },
        None => {
            tracing::info!(
                "{REDIS_URL_ENV_VAR} not set, using the local quota store. Quotas will not be shared across instances."
            );
            setup_local_store(config, clock).await
        }
    };

    Ok(QuotaEngine::new(
        backend,
        policy,
        quota_config.anonymous_user_id.clone(),
    ))
}

async fn setup_local_store(config: &Config, clock: Arc<dyn Clock>) -> Arc<dyn QuotaBackend> {
    let store = LocalQuotaStore::new(config.quota.policy(), clock);
    if let Some(sweep_interval) = config.quota.sweep_interval() {
        store.start_sweeper(sweep_interval).await;
    }
    Arc::new(store)
}

/// Routes served by every gateway, without process-wide layers such as `/metrics`
pub fn build_router(app_state: AppStateData) -> Router {
    Router::new()
        .route(
            "/api/free-reads",
            get(endpoints::free_reads::inspect_handler)
                .post(endpoints::free_reads::free_reads_handler),
        )
        .layer(axum::middleware::map_response(
            endpoints::free_reads::set_no_store,
        ))
        .route("/api/ok", get(endpoints::status::ok_handler))
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .fallback(endpoints::fallback::handle_404)
        .with_state(app_state)
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
/// Deserialization failures name the offending field by its JSON path.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // Retrieve the request body as Bytes before deserializing it
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::InvalidArgument {
                field: "body".to_string(),
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        // An empty body is treated as an empty object, so every field takes its default
        let value = if bytes.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            Json::<serde_json::Value>::from_bytes(&bytes)
                .map_err(|e| {
                    Error::new(ErrorDetails::InvalidArgument {
                        field: "body".to_string(),
                        message: format!("{} ({})", e, e.status()),
                    })
                })?
                .0
        };

        // Now use `serde_path_to_error::deserialize` to attempt deserialization into `T`
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            let path = e.path().to_string();
            Error::new(ErrorDetails::InvalidArgument {
                field: if path == "." { "body".to_string() } else { path },
                message: e.into_inner().to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}

pub struct ShutdownHandle {
    #[expect(dead_code)]
    sender: Sender<()>,
}

/// Starts a gateway on an unused local port with the quota routes enabled.
///
/// Returns the address the gateway is listening on and a `ShutdownHandle` which shuts the
/// gateway down when dropped.
pub async fn start_free_reads_gateway(
    config: Arc<Config>,
    redis_url: Option<SecretString>,
) -> Result<(SocketAddr, ShutdownHandle), Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Failed to bind to a port: {e}"),
            })
        })?;
    let bind_addr = listener.local_addr().map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to get local address: {e}"),
        })
    })?;

    let app_state = AppStateData::new_with_redis_url(config, redis_url).await?;
    let router = build_router(app_state);

    let (sender, recv) = tokio::sync::oneshot::channel::<()>();
    let shutdown_fut = async move {
        let _ = recv.await;
    };

    tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_fut)
            .into_future(),
    );
    Ok((bind_addr, ShutdownHandle { sender }))
}
