//! HTTP API.
//!
//! Every response uses the `{success, data | error}` envelope, including
//! health and service-info. Engine errors map onto status codes through
//! their kind.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::db::{DbHandle, LogQuery};
use crate::engines::EngineRegistry;
use crate::errors::EngineError;
use crate::events::{EventBus, ProjectCache};
use crate::execution::{ExecuteRequest, FollowUpRequest, IssueEngine};
use crate::models::*;
use crate::sse;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub engine: Arc<IssueEngine>,
    pub bus: EventBus,
    pub registry: Arc<EngineRegistry>,
    pub project_cache: Arc<ProjectCache>,
    pub config: Config,
}

pub type SharedState = Arc<AppState>;

// ── Envelope ──────────────────────────────────────────────────────────

fn ok(data: impl Serialize) -> Json<serde_json::Value> {
    Json(json!({"success": true, "data": data}))
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"success": false, "error": self.message})),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

// ── Request payloads ──────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: String,
    pub alias: Option<String>,
    pub description: Option<String>,
    pub directory: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIssueRequest {
    pub title: String,
    pub prompt: Option<String>,
    pub status: Option<String>,
    pub parent_issue_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteIssueRequest {
    pub engine_type: EngineType,
    pub prompt: String,
    pub working_dir: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpIssueRequest {
    pub prompt: String,
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub busy_action: BusyAction,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsParams {
    pub cursor: Option<i64>,
    pub before: Option<i64>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub dev_mode: bool,
}

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 500;

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/info", get(service_info))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/:id/issues", post(create_issue))
        .route("/api/issues/:id", get(get_issue))
        .route("/api/issues/:id/execute", post(execute_issue))
        .route("/api/issues/:id/follow-up", post(follow_up_issue))
        .route("/api/issues/:id/restart", post(restart_issue))
        .route("/api/issues/:id/cancel", post(cancel_issue))
        .route("/api/issues/:id/logs", get(get_logs))
        .route("/api/engines", get(list_engines))
        .route("/api/engines/:engine/models", get(engine_models))
        .route("/events", get(sse::events_handler))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    ok(json!({"status": "ok"}))
}

async fn service_info(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    if !state.config.enable_runtime_endpoint {
        return Err(ApiError::not_found("runtime endpoint is disabled"));
    }
    Ok(ok(json!({
        "service": state.config.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "activeExecutions": state.engine.active_count(),
    })))
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.db.call(|db| db.list_projects()).await?;
    Ok(ok(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("project name must not be empty"));
    }
    let project = state
        .db
        .call(move |db| {
            db.create_project(
                &req.name,
                req.alias.as_deref(),
                req.description.as_deref(),
                req.directory.as_deref(),
            )
        })
        .await?;
    Ok((StatusCode::CREATED, ok(project)))
}

async fn create_issue(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::bad_request("issue title must not be empty"));
    }
    let status = match req.status.as_deref() {
        Some(raw) => IssueStatus::from_str(raw).map_err(ApiError::bad_request)?,
        None => IssueStatus::Todo,
    };
    let issue = state
        .db
        .call(move |db| {
            db.create_issue(
                &project_id,
                &req.title,
                req.prompt.as_deref(),
                status,
                req.parent_issue_id.as_deref(),
            )
        })
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    state
        .bus
        .publish(crate::events::EngineEvent::IssueUpdated {
            issue: issue.clone(),
        });
    Ok((StatusCode::CREATED, ok(issue)))
}

async fn get_issue(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .db
        .call(move |db| db.get_issue(&id))
        .await?
        .filter(|issue| !issue.is_deleted)
        .ok_or_else(|| ApiError::not_found("issue not found"))?;
    Ok(ok(issue))
}

async fn execute_issue(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state
        .engine
        .execute_issue(
            &id,
            ExecuteRequest {
                engine_type: req.engine_type,
                prompt: req.prompt,
                working_dir: req.working_dir.map(PathBuf::from),
                model: req.model,
                permission_mode: req.permission_mode,
            },
        )
        .await?;
    Ok(ok(info))
}

async fn follow_up_issue(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<FollowUpIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .engine
        .follow_up_issue(
            &id,
            FollowUpRequest {
                prompt: req.prompt,
                model: req.model,
                permission_mode: req.permission_mode,
                busy_action: req.busy_action,
            },
        )
        .await?;
    Ok(ok(outcome))
}

async fn restart_issue(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.engine.restart_issue(&id).await?;
    Ok(ok(info))
}

async fn cancel_issue(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let final_status = state.engine.cancel_issue(&id).await?;
    Ok(ok(json!({"finalStatus": final_status})))
}

async fn get_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .engine
        .get_logs(
            &id,
            LogQuery {
                cursor: params.cursor,
                before: params.before,
                limit: params.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT),
                dev_mode: params.dev_mode,
            },
        )
        .await?;
    Ok(ok(page))
}

async fn list_engines(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let mut engines = serde_json::Map::new();
    for engine in EngineType::all() {
        let availability = state.registry.availability(*engine).await;
        engines.insert(engine.to_string(), serde_json::to_value(availability)?);
    }
    Ok(ok(engines))
}

async fn engine_models(
    State(state): State<SharedState>,
    Path(engine): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = EngineType::from_str(&engine).map_err(ApiError::bad_request)?;
    let models = state.registry.models(engine).await;
    Ok(ok(models))
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}
