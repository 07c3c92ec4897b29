//! HTTP read endpoints

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::ReadError;
use crate::limiter::Admission;
use crate::service::{BalanceQuery, PositionQuery, PositionService};

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionParams {
    pub chain_id: Option<String>,
    pub pool_address: Option<String>,
    pub user_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceParams {
    pub chain_id: Option<String>,
    pub token_address: Option<String>,
    pub owner_address: Option<String>,
}

/// Error body returned for every failed request
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub fn router(service: PositionService) -> Router {
    Router::new()
        .route("/api/positions", get(get_positions))
        .route("/api/balance", get(get_balance))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

fn rate_limit_headers(admission: &Admission) -> [(&'static str, String); 3] {
    [
        (RATE_LIMIT_LIMIT, admission.limit.to_string()),
        (RATE_LIMIT_REMAINING, admission.remaining.to_string()),
        (RATE_LIMIT_RESET, admission.reset_at_ms().to_string()),
    ]
}

/// Unwrap query parameters, turning axum's plain-text rejection into a
/// [`ReadError`] so the client still gets a JSON error body.
fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ReadError> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| ReadError::InvalidParameter {
            name: "query",
            reason: rejection.body_text(),
        })
}

async fn get_positions(
    State(service): State<PositionService>,
    params: Result<Query<PositionParams>, QueryRejection>,
) -> Result<Response, ReadError> {
    let params = query_params(params)?;
    let query = PositionQuery::from_params(
        params.chain_id.as_deref(),
        params.pool_address.as_deref(),
        params.user_address.as_deref(),
    )?;
    let reply = service.positions(query).await?;
    debug!(
        "Served {} positions for chain {} (cached={})",
        reply.positions.len(),
        query.chain_id,
        reply.cached
    );
    Ok((
        rate_limit_headers(&reply.admission),
        Json(reply.positions.as_ref()),
    )
        .into_response())
}

async fn get_balance(
    State(service): State<PositionService>,
    params: Result<Query<BalanceParams>, QueryRejection>,
) -> Result<Response, ReadError> {
    let params = query_params(params)?;
    let query = BalanceQuery::from_params(
        params.chain_id.as_deref(),
        params.token_address.as_deref(),
        params.owner_address.as_deref(),
    )?;
    let reply = service.balance(query).await?;
    let admission = reply
        .admission
        .unwrap_or_else(|| service.limiter().status(query.chain_id));
    Ok((rate_limit_headers(&admission), Json(reply)).into_response())
}

async fn health(State(service): State<PositionService>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "chains": service.pool().chain_ids(),
    }))
}

impl IntoResponse for ReadError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };

        if self.is_client_error() {
            debug!("Rejected request: {}", self);
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }

        if let ReadError::RateLimited {
            limit, reset_at_ms, ..
        } = self
        {
            let headers = [
                (RATE_LIMIT_LIMIT, limit.to_string()),
                (RATE_LIMIT_REMAINING, "0".to_owned()),
                (RATE_LIMIT_RESET, reset_at_ms.to_string()),
            ];
            return (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response();
        }

        error!("Request failed: {}", self);
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
