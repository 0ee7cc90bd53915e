//! Execution endpoints: start, cancel, snapshot, listing and the event
//! page.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use playmill_store::ExecutionFilter;

use crate::error::{AppError, AppResult};
use crate::services::StartRequest;

use super::{AppState, ListResponse};

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExecuteRequest {
    pub path: String,
    /// Specific catalog version; latest when omitted.
    #[serde(default)]
    pub version: Option<i32>,
    /// Input payload merged into the playbook workload.
    #[serde(default)]
    pub payload: Value,
    /// Deep-merge the payload over workload defaults (default true);
    /// false replaces the workload wholesale.
    #[serde(default = "default_merge")]
    pub merge: bool,
}

fn default_merge() -> bool {
    true
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExecuteResponse {
    pub execution_id: i64,
    pub path: String,
    pub version: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub path: Option<String>,
    pub status: Option<String>,
    pub parent_execution_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub execution_id: i64,
    /// Return events with ids strictly greater than this.
    pub since: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EventPage {
    #[schema(value_type = Vec<Object>)]
    pub data: Vec<Value>,
    /// Cursor for the next page.
    pub last_event_id: i64,
}

/// Start an execution of a registered playbook.
#[utoipa::path(
    post,
    path = "/execute",
    request_body = ExecuteRequest,
    responses(
        (status = 200, description = "Execution created", body = ExecuteResponse),
        (status = 404, description = "Unknown playbook", body = super::ErrorResponse),
    ),
    tag = "executions",
)]
pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    let record = state
        .executions
        .start(StartRequest {
            path: request.path,
            version: request.version,
            payload: request.payload,
            merge: request.merge,
            parent: None,
        })
        .await?;
    Ok(Json(ExecuteResponse {
        execution_id: record.execution_id,
        path: record.path,
        version: record.version,
    }))
}

/// Cancel an execution cooperatively.
#[utoipa::path(
    post,
    path = "/cancel/{execution_id}",
    responses(
        (status = 200, description = "Cancelled", body = CancelResponse),
        (status = 409, description = "Already terminal", body = super::ErrorResponse),
    ),
    tag = "executions",
)]
pub async fn cancel(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> AppResult<Json<CancelResponse>> {
    state.executions.cancel(execution_id).await?;
    Ok(Json(CancelResponse { ok: true }))
}

/// Current snapshot of an execution, reconstructed from its events.
#[utoipa::path(
    get,
    path = "/execution/{execution_id}",
    responses(
        (status = 200, description = "Snapshot"),
        (status = 404, description = "Unknown execution", body = super::ErrorResponse),
    ),
    tag = "executions",
)]
pub async fn snapshot(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> AppResult<Json<Value>> {
    let snapshot = state.executions.snapshot(execution_id).await?;
    Ok(Json(serde_json::to_value(snapshot).map_err(|e| {
        AppError::Internal(e.to_string())
    })?))
}

/// List executions.
#[utoipa::path(
    get,
    path = "/executions",
    responses((status = 200, description = "Execution listing")),
    tag = "executions",
)]
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> AppResult<Json<ListResponse<Value>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(AppError::Validation)?;
    let records = state
        .executions
        .list(ExecutionFilter {
            path: query.path,
            status,
            parent_execution_id: query.parent_execution_id,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    let data = records
        .into_iter()
        .map(|record| serde_json::to_value(record).unwrap_or(Value::Null))
        .collect();
    Ok(Json(ListResponse { data }))
}

/// Page through an execution's event stream.
#[utoipa::path(
    get,
    path = "/events",
    params(
        ("execution_id" = i64, Query, description = "Execution to read"),
        ("since" = Option<i64>, Query, description = "Exclusive event id cursor"),
        ("limit" = Option<i64>, Query, description = "Page size"),
    ),
    responses(
        (status = 200, description = "Event page", body = EventPage),
        (status = 404, description = "Unknown execution", body = super::ErrorResponse),
    ),
    tag = "executions",
)]
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<EventPage>> {
    let events = state
        .executions
        .events(query.execution_id, query.since, query.limit)
        .await?;
    let last_event_id = events
        .last()
        .map(|event| event.event_id)
        .unwrap_or(query.since.unwrap_or(0));
    let data = events
        .into_iter()
        .map(|event| serde_json::to_value(event).unwrap_or(Value::Null))
        .collect();
    Ok(Json(EventPage {
        data,
        last_event_id,
    }))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/cancel/:execution_id", post(cancel))
        .route("/execution/:execution_id", get(snapshot))
        .route("/executions", get(list))
        .route("/events", get(events))
        .with_state(state)
}
