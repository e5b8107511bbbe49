//! # REST Façade
//!
//! JSON API in front of the dispatcher. Paths and response shapes are
//! contract-stable; the WebSocket control plane lives in [`super::ws`].

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::coordinator::ws::ws_handler;
use crate::coordinator::CoordinatorState;
use crate::types::{ErrorKind, HeaderMap, JobError, JobRequest, RequestConfig};

pub fn router(state: Arc<CoordinatorState>) -> Router {
    Router::new()
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:id", delete(remove_agent))
        .route("/api/config/request", post(store_config).get(fetch_config))
        .route("/api/execute", post(execute).get(execute_stored))
        .route("/api/pool/status", get(pool_status))
        .route("/api/stats", get(stats))
        .route("/api/history", get(history))
        .route("/metrics", get(metrics))
        .route("/ws/agent", get(ws_handler))
        .with_state(state)
}

/// HTTP status for a dispatch failure kind
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NoAgentsAvailable | ErrorKind::AgentsSaturated => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::CoordinatorOverloaded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(job_id: Option<uuid::Uuid>, err: &JobError) -> Response {
    (
        status_for(err.kind),
        Json(json!({
            "error": err.kind,
            "message": err.message,
            "job_id": job_id,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize, Default)]
struct RegisterBody {
    agent_id: Option<String>,
}

async fn register_agent(
    State(state): State<Arc<CoordinatorState>>,
    body: Option<Json<RegisterBody>>,
) -> Response {
    let requested = body.and_then(|Json(b)| b.agent_id);
    match state.registry.reserve(requested) {
        Ok(agent_id) => Json(json!({ "agent_id": agent_id })).into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "InvalidRequest", "message": err.to_string() })),
        )
            .into_response(),
    }
}

async fn list_agents(State(state): State<Arc<CoordinatorState>>) -> Response {
    Json(state.registry.snapshot()).into_response()
}

async fn remove_agent(
    State(state): State<Arc<CoordinatorState>>,
    Path(agent_id): Path<String>,
) -> Response {
    let removed = match state.registry.remove(&agent_id) {
        Some(live_epoch) => {
            if let Some(epoch) = live_epoch {
                state.pending.fail_agent(
                    &agent_id,
                    Some(epoch + 1),
                    ErrorKind::AgentLost,
                    "agent removed by operator",
                );
            }
            info!(agent_id, "agent removed via API");
            true
        }
        None => false,
    };
    Json(json!({ "removed": removed })).into_response()
}

async fn store_config(
    State(state): State<Arc<CoordinatorState>>,
    Json(config): Json<RequestConfig>,
) -> Response {
    *state.request_config.lock() = Some(config);
    Json(json!({ "ok": true })).into_response()
}

async fn fetch_config(State(state): State<Arc<CoordinatorState>>) -> Response {
    Json(state.request_config.lock().clone()).into_response()
}

/// `POST /api/execute` body. The wire field is `timeout`; the job model's
/// `timeout_sec` spelling is accepted as an alias.
#[derive(Debug, Deserialize)]
struct ExecuteBody {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HeaderMap,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default, alias = "timeout_sec")]
    timeout: Option<f64>,
}

fn default_method() -> String {
    "GET".to_string()
}

async fn execute(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<ExecuteBody>,
) -> Response {
    let request = JobRequest {
        method: body.method,
        url: body.url,
        headers: body.headers,
        body: body.body,
        timeout_sec: body.timeout.unwrap_or(state.default_timeout_secs),
    };
    run_job(&state, request).await
}

/// `GET /api/execute` replays the stored request template
async fn execute_stored(State(state): State<Arc<CoordinatorState>>) -> Response {
    let config = state.request_config.lock().clone();
    match config {
        Some(config) => run_job(&state, config.into()).await,
        None => error_response(
            None,
            &JobError::invalid_request("no request config stored; POST /api/config/request first"),
        ),
    }
}

async fn run_job(state: &Arc<CoordinatorState>, request: JobRequest) -> Response {
    let done = state.dispatcher.execute(request).await;
    match done.outcome {
        Ok(response) => Json(json!({
            "job_id": done.job_id,
            "agent_id": done.agent_id,
            "source_ip": done.source_ip,
            "status": response.status,
            "headers": response.headers,
            "body": String::from_utf8_lossy(&response.body),
            "elapsed_sec": response.elapsed_sec,
        }))
        .into_response(),
        Err(err) => error_response(Some(done.job_id), &err),
    }
}

async fn pool_status(State(state): State<Arc<CoordinatorState>>) -> Response {
    let entries: Vec<serde_json::Value> = state
        .pool
        .entries()
        .into_iter()
        .map(|e| json!({ "agent_id": e.agent_id, "ip": e.ip, "family": e.family() }))
        .collect();
    Json(json!({ "size": entries.len(), "entries": entries })).into_response()
}

async fn stats(State(state): State<Arc<CoordinatorState>>) -> Response {
    Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "requests_total": state.metrics.counter_total("http_dispatcher_requests_total"),
        "request_errors_total": state.metrics.counter_total("http_dispatcher_request_errors_total"),
        "agents_connected": state.registry.live_count(),
        "agents_total": state.registry.snapshot().len(),
        "ip_pool_size": state.pool.size(),
        "in_flight": state.pending.len(),
        "history_entries": state.history.len(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history(
    State(state): State<Arc<CoordinatorState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    Json(state.history.snapshot(query.limit.unwrap_or(100))).into_response()
}

async fn metrics(State(state): State<Arc<CoordinatorState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {err}"),
        )
            .into_response(),
    }
}
