// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # HTTP control surface
//!
//! REST routes over [`Operator`]. Handlers translate requests into operator
//! calls and [`OperatorError`]s into `{"error": ..., "details": [...]}`
//! bodies with a matching status code.

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::error;

use crate::application::operator::{Operator, OperatorError};
use crate::domain::credentials::CredentialError;
use crate::domain::history::HistoryError;
use crate::domain::runtime::{LogOptions, LogStream, RuntimeError};
use crate::domain::stack::StackSpec;
use crate::infrastructure::spec_store::SpecStoreError;

use super::{mcp, middleware};

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub operator: Arc<Operator>,
    pub api_key: Option<Arc<str>>,
    pub cors_origins: Arc<[String]>,
}

impl AppState {
    pub fn new(operator: Arc<Operator>, api_key: Option<String>, cors_origins: Vec<String>) -> Self {
        Self {
            operator,
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
            cors_origins: cors_origins.into(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    layered(routes(), state)
}

/// Every control-surface route, without middleware or state.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config_get).post(config_set))
        .route("/deploy", post(deploy))
        .route("/plan", get(plan))
        .route("/rollback", post(rollback))
        .route("/status", get(status))
        .route("/logs/{service}", get(service_logs))
        .route("/scale/{service}", post(scale))
        .route("/down", post(down))
        .route("/agents", get(agents))
        .route("/agents/{name}/start", post(agent_start))
        .route("/agents/{name}/stop", post(agent_stop))
        .route("/agents/{name}/logs", get(agent_logs))
        .route("/history", get(history))
        .route("/credentials", get(credentials_list))
        .route(
            "/credentials/{name}",
            put(credentials_set).delete(credentials_delete),
        )
        .route("/mcp", post(mcp::handle))
}

/// Wrap `router` in the auth, CORS, panic and trace layers and bind `state`.
pub fn layered(router: Router<AppState>, state: AppState) -> Router {
    router
        .layer(from_fn_with_state(state.clone(), middleware::require_bearer))
        .layer(from_fn_with_state(state.clone(), middleware::cors))
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message.into(),
                details: Vec::new(),
            },
        }
    }
}

pub fn status_for(err: &OperatorError) -> StatusCode {
    match err {
        OperatorError::Validation(_)
        | OperatorError::Compile(_)
        | OperatorError::BadRequest(_) => StatusCode::BAD_REQUEST,
        OperatorError::Credential(CredentialError::InvalidName(_))
        | OperatorError::Credential(CredentialError::MissingRequired(_)) => {
            StatusCode::BAD_REQUEST
        }
        OperatorError::Credential(_) => StatusCode::INTERNAL_SERVER_ERROR,
        OperatorError::Spec(SpecStoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        OperatorError::Spec(SpecStoreError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        OperatorError::Spec(_) => StatusCode::BAD_REQUEST,
        OperatorError::Runtime(RuntimeError::ServiceNotFound(_)) => StatusCode::NOT_FOUND,
        OperatorError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        OperatorError::History(HistoryError::UnknownRevision(_)) => StatusCode::BAD_REQUEST,
        OperatorError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
        OperatorError::NotFound { .. } => StatusCode::NOT_FOUND,
        OperatorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OperatorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OperatorError> for ApiError {
    fn from(err: OperatorError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!("request failed: {}", err);
        }
        Self {
            status,
            body: ErrorBody {
                details: err.details(),
                error: err.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn text_stream(stream: LogStream) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.operator.health())
}

async fn config_get(State(state): State<AppState>) -> ApiResult<Json<StackSpec>> {
    Ok(Json(state.operator.config_get().await?))
}

async fn config_set(
    State(state): State<AppState>,
    payload: Result<Json<StackSpec>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(spec) = payload?;
    Ok(Json(state.operator.config_set(spec).await?))
}

async fn deploy(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.deploy().await?))
}

async fn plan(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.plan().await?))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub sha: String,
}

async fn rollback(
    State(state): State<AppState>,
    payload: Result<Json<RollbackRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    Ok(Json(state.operator.rollback(&request.sha).await?))
}

async fn status(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.status().await?))
}

async fn service_logs(
    State(state): State<AppState>,
    Path(service): Path<String>,
    query: Result<Query<LogOptions>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(options) = query?;
    Ok(text_stream(state.operator.logs(&service, &options).await?))
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

async fn scale(
    State(state): State<AppState>,
    Path(service): Path<String>,
    payload: Result<Json<ScaleRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    state.operator.scale(&service, request.replicas).await?;
    Ok(Json(json!({ "service": service, "replicas": request.replicas })))
}

async fn down(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state.operator.down().await?;
    Ok(Json(json!({ "status": "down" })))
}

async fn agents(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.agents().await?))
}

async fn agent_start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.operator.agent_start(&name).await?;
    Ok(Json(json!({ "agent": name, "status": "started" })))
}

async fn agent_stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.operator.agent_stop(&name).await?;
    Ok(Json(json!({ "agent": name, "status": "stopped" })))
}

async fn agent_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<LogOptions>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(options) = query?;
    Ok(text_stream(state.operator.agent_logs(&name, &options).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub n: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let limit = query.n.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.operator.history(limit).await?))
}

async fn credentials_list(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.operator.credentials_list().await?))
}

#[derive(Debug, Deserialize)]
pub struct CredentialValue {
    pub value: String,
}

async fn credentials_set(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<CredentialValue>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = payload?;
    Ok(Json(state.operator.credentials_set(&name, &body.value).await?))
}

async fn credentials_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.operator.credentials_delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
