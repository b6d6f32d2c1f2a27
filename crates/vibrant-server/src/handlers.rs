//! HTTP handlers for callers and agent subscriptions.

use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use vibrant_core::{BrokerError, ClientId, ClientIdError, CommandPayload, RequestId};

use crate::broker::AwaitOutcome;
use crate::connection::{run_connection, AgentSession, ConnectionTimings};
use crate::fanout::FanOutSummary;
use crate::server::AppState;

/// Errors surfaced to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid client id: {0}")]
    InvalidClientId(#[from] ClientIdError),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("timed out waiting for agent response")]
    Timeout { request_id: RequestId },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidClientId(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidClientId(_) => "invalid_client_id",
            Self::BadRequest(_) => "bad_request",
            Self::Broker(e) => e.error_kind(),
            Self::Timeout { .. } => "timeout",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.to_string(),
            "code": self.error_kind(),
        });
        if let Self::Timeout { request_id } = &self {
            body["requestId"] = json!(request_id);
        }
        (self.status(), Json(body)).into_response()
    }
}

/// `?wait=true&timeoutMs=…`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandQuery {
    #[serde(default)]
    pub wait: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ScreenshotRequest {
    #[serde(default)]
    pub selectors: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasteRequest {
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub data_url: String,
}

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub clients: Vec<FanOutSummary>,
    pub total_connections: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub clients: usize,
    pub connections: usize,
    pub pending_requests: usize,
}

/// GET /agents/{client_id}/subscribe
pub async fn subscribe(
    Path(raw_client_id): Path<String>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let (session, rx) = AgentSession::validate(
        &raw_client_id,
        state.broker.clone(),
        state.config.max_send_queue,
    )?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let timings = ConnectionTimings {
        heartbeat_interval: state.config.heartbeat_interval(),
        idle_timeout: state.config.idle_timeout(),
    };
    let welcome = state
        .config
        .welcome_script
        .clone()
        .map(|script| (script, state.config.welcome_delay()));

    Ok(ws
        .max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _ = run_connection(socket, session, rx, timings, welcome).await;
        }))
}

/// POST /agents/{client_id}/eval (body is the script text)
pub async fn eval(
    Path(raw_client_id): Path<String>,
    Query(query): Query<CommandQuery>,
    State(state): State<AppState>,
    script: String,
) -> Result<Response, ApiError> {
    let client_id = ClientId::parse(&raw_client_id)?;
    if script.is_empty() {
        return Err(ApiError::BadRequest("script body cannot be empty".into()));
    }
    run_command(&state, &client_id, CommandPayload::evaluate(script), &query).await
}

/// POST /agents/{client_id}/screenshots
pub async fn screenshots(
    Path(raw_client_id): Path<String>,
    Query(query): Query<CommandQuery>,
    State(state): State<AppState>,
    Json(body): Json<ScreenshotRequest>,
) -> Result<Response, ApiError> {
    let client_id = ClientId::parse(&raw_client_id)?;
    let selectors: Vec<String> = body
        .selectors
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect();
    if selectors.is_empty() {
        return Err(ApiError::BadRequest("at least one selector is required".into()));
    }
    run_command(&state, &client_id, CommandPayload::Screenshot { selectors }, &query).await
}

/// POST /agents/{client_id}/paste
pub async fn paste(
    Path(raw_client_id): Path<String>,
    Query(query): Query<CommandQuery>,
    State(state): State<AppState>,
    Json(body): Json<PasteRequest>,
) -> Result<Response, ApiError> {
    let client_id = ClientId::parse(&raw_client_id)?;
    if body.selector.is_empty() || body.data_url.is_empty() {
        return Err(ApiError::BadRequest("selector and dataUrl are required".into()));
    }
    let payload = CommandPayload::Paste {
        selector: body.selector,
        data_url: body.data_url,
    };
    run_command(&state, &client_id, payload, &query).await
}

async fn run_command(
    state: &AppState,
    client_id: &ClientId,
    payload: CommandPayload,
    query: &CommandQuery,
) -> Result<Response, ApiError> {
    let command_type = payload.kind().command_type();

    if !query.wait {
        let request_id = state.broker.send(client_id, payload)?;
        return Ok(Json(json!({
            "status": format!("{command_type} command sent"),
            "requestId": request_id,
        }))
        .into_response());
    }

    let timeout: Duration = state.config.await_timeout(query.timeout_ms);
    let request = state.broker.submit(client_id, payload)?;
    let request_id = request.id().clone();
    debug!(client_id = %client_id, request_id = %request_id, "waiting for agent response");

    match state.broker.await_reply(request, Some(timeout)).await {
        AwaitOutcome::Resolved(result) => Ok(Json(json!({
            "requestId": request_id,
            "response": result.to_response_json(),
        }))
        .into_response()),
        AwaitOutcome::TimedOut | AwaitOutcome::Closed => Err(ApiError::Timeout { request_id }),
    }
}

#[derive(Debug, Deserialize)]
pub struct TestEvalQuery {
    pub agent: Option<String>,
    pub script: Option<String>,
}

/// GET /test_eval?agent=…&script=…, fires an evaluate from a browser address bar.
pub async fn test_eval(
    Query(query): Query<TestEvalQuery>,
    State(state): State<AppState>,
) -> Result<String, ApiError> {
    let (Some(agent), Some(script)) = (query.agent, query.script) else {
        return Err(ApiError::BadRequest("missing 'agent' or 'script' query parameter".into()));
    };
    if agent.is_empty() || script.is_empty() {
        return Err(ApiError::BadRequest("missing 'agent' or 'script' query parameter".into()));
    }
    let client_id = ClientId::parse(&agent)?;
    let request_id = state.broker.send(&client_id, CommandPayload::evaluate(script.clone()))?;
    info!(client_id = %client_id, request_id = %request_id, "test eval sent");
    Ok(format!(
        "Sent EVALUATE_SCRIPT to agent {client_id} (ReqID: {request_id}). Script: '{script}'"
    ))
}

/// GET /agents
pub async fn list_agents(State(state): State<AppState>) -> Json<AgentsResponse> {
    let fanouts = state.broker.fanouts();
    Json(AgentsResponse {
        clients: fanouts.snapshot(),
        total_connections: fanouts.connection_count(),
    })
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let fanouts = state.broker.fanouts();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        clients: fanouts.client_count(),
        connections: fanouts.connection_count(),
        pending_requests: state.broker.pending_count(),
    })
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
