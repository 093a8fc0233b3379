//! `flowctl serve` command: REST surface over executions, dead letters, and
//! live workers.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use flow_core::definition::registry::DefinitionRegistry;
use flow_core::Engine;
use flow_db::models::{Execution, ExecutionStatus, Task, WorkerRecord};
use flow_db::queries::dead_letters::{self, DeadLetterFilter};
use flow_db::queries::{executions as exec_db, tasks as task_db, workers as worker_db};

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    definitions: Arc<DefinitionRegistry>,
}

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{err:#}") }
    }
}

impl From<flow_core::FlowError> for AppError {
    fn from(err: flow_core::FlowError) -> Self {
        match err {
            flow_core::FlowError::NotFound(msg) => Self::not_found(msg),
            flow_core::FlowError::Conflict(msg) | flow_core::FlowError::Invalid(msg) => {
                Self::bad_request(msg)
            }
            flow_core::FlowError::Fatal(msg) => {
                Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg }
            }
            flow_core::FlowError::Infra(e) => Self::internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ExecutionDetailResponse {
    #[serde(flatten)]
    execution: Execution,
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    workflow_name: String,
    #[serde(default = "default_version")]
    workflow_version: i32,
    input: serde_json::Value,
    idempotency_key: Option<String>,
}

fn default_version() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    workflow_name: Option<String>,
    execution_id: Option<Uuid>,
    step_name: Option<String>,
}

pub fn build_router(pool: PgPool, definitions: Arc<DefinitionRegistry>) -> Router {
    let state = AppState { pool, definitions };
    Router::new()
        .route("/", get(index))
        .route("/executions", get(list_executions).post(trigger_execution))
        .route("/executions/{id}", get(get_execution_detail))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}/reprocess", post(reprocess_dead_letter))
        .route("/workers", get(list_workers))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(pool: PgPool, definitions: Arc<DefinitionRegistry>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(pool, definitions);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("flowctl serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("flowctl serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

async fn index(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let executions = exec_db::list_executions(&state.pool, None)
        .await
        .map_err(AppError::internal)?;

    let rows = if executions.is_empty() {
        "<tr><td colspan=\"3\">No executions found.</td></tr>".to_string()
    } else {
        executions
            .iter()
            .map(|e| {
                format!(
                    "<tr><td><a href=\"/executions/{id}\">{name}</a></td><td>{status}</td><td>{id}</td></tr>",
                    id = e.id,
                    name = e.workflow_name,
                    status = e.status,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>flowctl</title></head><body>\
<h1>flowctl</h1>\
<p><a href=\"/executions\">/executions</a> | <a href=\"/dead-letters\">/dead-letters</a> | <a href=\"/workers\">/workers</a></p>\
<table><tr><th>Workflow</th><th>Status</th><th>ID</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<axum::response::Response, AppError> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<ExecutionStatus>())
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let executions = exec_db::list_executions(&state.pool, status)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(executions).into_response())
}

async fn trigger_execution(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<axum::response::Response, AppError> {
    let engine = Engine::new(state.pool.clone(), state.definitions.clone());
    let execution = engine
        .trigger(
            &req.workflow_name,
            req.workflow_version,
            req.input,
            req.idempotency_key.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(execution)).into_response())
}

async fn get_execution_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let execution = exec_db::get_execution(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("execution {id} not found")))?;

    let tasks = task_db::list_tasks_for_execution(&state.pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(ExecutionDetailResponse { execution, tasks }).into_response())
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let engine = Engine::new(state.pool.clone(), state.definitions.clone());
    engine.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<axum::response::Response, AppError> {
    let filter = DeadLetterFilter {
        workflow_name: query.workflow_name.as_deref(),
        execution_id: query.execution_id,
        step_name: query.step_name.as_deref(),
    };
    let rows = dead_letters::list_dead_letters(&state.pool, &filter)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(rows).into_response())
}

async fn reprocess_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = flow_core::dead_letter::reprocess(&state.pool, id).await?;
    Ok(Json(task).into_response())
}

async fn list_workers(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let workers: Vec<WorkerRecord> = worker_db::list_workers(&state.pool, None)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(workers).into_response())
}
