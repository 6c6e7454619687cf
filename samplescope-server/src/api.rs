use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use samplescope_core::metrics::MetricsSnapshot;
use samplescope_core::{EngineError, Lifecycle, LifecycleStatus, Row};

#[derive(Clone)]
pub struct ApiState {
    lifecycle: Arc<Lifecycle>,
}

impl ApiState {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[derive(Serialize)]
struct StatusPayload {
    generated_at_ms: u64,
    status: LifecycleStatus,
    is_loading: bool,
    error: Option<String>,
    metrics: MetricsSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

#[derive(Serialize)]
struct QueryPayload {
    rows: Vec<Row>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status.json", get(status_json))
        .route("/query", post(run_query))
        .with_state(state)
}

async fn status_json(State(state): State<ApiState>) -> Json<StatusPayload> {
    let lifecycle = &state.lifecycle;
    Json(StatusPayload {
        generated_at_ms: now_millis(),
        status: lifecycle.status(),
        is_loading: lifecycle.is_loading(),
        error: lifecycle.error(),
        metrics: lifecycle.metrics().snapshot(),
    })
}

async fn run_query(State(state): State<ApiState>, Json(request): Json<QueryRequest>) -> Response {
    match state.lifecycle.query_facade().execute_query(&request.sql).await {
        Ok(rows) => Json(QueryPayload { rows }).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &EngineError) -> Response {
    let status = match err {
        EngineError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::QueryExecutionFailed(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
