use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use axum::{debug_handler, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::quota::{QuotaDecision, QuotaSnapshot};

/// Quota state changes on every call, so no intermediary may cache a response
pub const NO_STORE: &str = "no-store, no-cache, must-revalidate";

pub async fn set_no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
    response
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectParams {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeReadsAction {
    #[default]
    Consume,
    Reset,
    Seed,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    pub user_id: Option<String>,
    #[serde(default)]
    pub action: FreeReadsAction,
    pub doc_id: Option<String>,
    // Any JSON value is accepted; only finite numbers count as an amount
    pub amount: Option<Value>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeReadsResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed: Option<Vec<String>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<QuotaSnapshot> for FreeReadsResponse {
    fn from(snapshot: QuotaSnapshot) -> Self {
        Self {
            ok: true,
            reason: None,
            remaining: snapshot.remaining,
            consumed: Some(snapshot.consumed),
            expires_at: Some(snapshot.expires_at),
        }
    }
}

impl From<QuotaDecision> for FreeReadsResponse {
    fn from(decision: QuotaDecision) -> Self {
        match decision {
            QuotaDecision::Allow { snapshot, .. } => snapshot.into(),
            QuotaDecision::Deny { reason } => Self {
                ok: false,
                reason: Some(reason.to_string()),
                remaining: 0,
                consumed: None,
                expires_at: None,
            },
        }
    }
}

/// Read-only view of a user's quota, creating the default record on first access
#[debug_handler(state = AppStateData)]
#[instrument(name = "free_reads.inspect", skip_all)]
pub async fn inspect_handler(
    State(AppStateData { quota_engine, .. }): AppState,
    params: Result<Query<InspectParams>, QueryRejection>,
) -> Result<Json<QuotaSnapshot>, Error> {
    // `userId` is the only query parameter, so any rejection is about it
    let Query(params) = params.map_err(|rejection| {
        Error::new(ErrorDetails::InvalidArgument {
            field: "userId".to_string(),
            message: rejection.body_text(),
        })
    })?;
    let snapshot = quota_engine.inspect(params.user_id.as_deref()).await?;
    Ok(Json(snapshot))
}

/// Consume, reset or seed a user's quota. Exhaustion is a normal `200` response with `ok: false`.
#[debug_handler(state = AppStateData)]
#[instrument(name = "free_reads.mutate", skip_all)]
pub async fn free_reads_handler(
    State(AppStateData { quota_engine, .. }): AppState,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Json<FreeReadsResponse>, Error> {
    let user_id = params.user_id.as_deref();
    let response: FreeReadsResponse = match params.action {
        FreeReadsAction::Consume => quota_engine
            .consume(user_id, params.doc_id.as_deref())
            .await?
            .into(),
        FreeReadsAction::Reset => quota_engine.reset(user_id).await?.into(),
        FreeReadsAction::Seed => {
            let amount = params.amount.as_ref().and_then(Value::as_f64);
            quota_engine.seed(user_id, amount).await?.into()
        }
    };
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    async fn app_state() -> AppStateData {
        AppStateData::new_with_redis_url(Arc::new(Config::default()), None)
            .await
            .unwrap()
    }

    fn params(value: Value) -> StructuredJson<Params> {
        StructuredJson(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_params_defaults() {
        let params: Params = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(params.action, FreeReadsAction::Consume);
        assert!(params.user_id.is_none());
        assert!(params.doc_id.is_none());

        let params: Params = serde_json::from_value(serde_json::json!({
            "userId": "u", "action": "seed", "amount": 4
        }))
        .unwrap();
        assert_eq!(params.action, FreeReadsAction::Seed);
        assert_eq!(params.user_id.as_deref(), Some("u"));

        assert!(serde_json::from_value::<Params>(serde_json::json!({"action": "delete"})).is_err());
    }

    #[test]
    fn test_denied_response_shape() {
        let response: FreeReadsResponse = QuotaDecision::Deny {
            reason: crate::quota::DenyReason::Limit,
        }
        .into();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"ok": false, "reason": "limit", "remaining": 0})
        );
    }

    #[tokio::test]
    async fn test_consume_flow() {
        let state = app_state().await;

        let Json(first) = free_reads_handler(
            State(state.clone()),
            params(serde_json::json!({"userId": "u", "docId": "docA"})),
        )
        .await
        .unwrap();
        assert!(first.ok);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.consumed, Some(vec!["docA".to_string()]));

        let Json(inspected) = inspect_handler(
            State(state.clone()),
            Ok(Query(InspectParams {
                user_id: Some("u".to_string()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(inspected.remaining, 1);
        assert_eq!(inspected.consumed, vec!["docA"]);
    }

    #[tokio::test]
    async fn test_seed_amount_handling() {
        let state = app_state().await;

        let Json(seeded) = free_reads_handler(
            State(state.clone()),
            params(serde_json::json!({"userId": "u", "action": "seed", "amount": 5.7})),
        )
        .await
        .unwrap();
        assert_eq!(seeded.remaining, 5);

        let Json(negative) = free_reads_handler(
            State(state.clone()),
            params(serde_json::json!({"userId": "u", "action": "seed", "amount": -2})),
        )
        .await
        .unwrap();
        assert_eq!(negative.remaining, 0);

        let Json(not_a_number) = free_reads_handler(
            State(state),
            params(serde_json::json!({"userId": "u", "action": "seed", "amount": "lots"})),
        )
        .await
        .unwrap();
        assert_eq!(not_a_number.remaining, 2);
    }

    #[tokio::test]
    async fn test_consume_without_doc_id_is_rejected() {
        let state = app_state().await;
        let err = free_reads_handler(State(state), params(serde_json::json!({"userId": "u"})))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
