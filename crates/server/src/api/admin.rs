//! Operational endpoints: health, queue counters, worker registry and the
//! PostgreSQL diagnostic passthrough.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Column, Connection, PgConnection, Row, TypeInfo};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

use super::{AppState, ListResponse};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "admin",
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Queue counters by status.
#[utoipa::path(
    get,
    path = "/queue/stats",
    responses((status = 200, description = "Queue counters")),
    tag = "admin",
)]
pub async fn queue_stats(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let stats = state.store.queue_stats().await?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| {
        AppError::Internal(e.to_string())
    })?))
}

/// Registered workers with load and liveness.
#[utoipa::path(
    get,
    path = "/workers",
    responses((status = 200, description = "Worker listing")),
    tag = "admin",
)]
pub async fn workers(State(state): State<AppState>) -> AppResult<Json<ListResponse<Value>>> {
    let data = state
        .store
        .list_workers()
        .await?
        .into_iter()
        .map(|worker| serde_json::to_value(worker).unwrap_or(Value::Null))
        .collect();
    Ok(Json(ListResponse { data }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PostgresExecuteRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub query_base64: Option<String>,
    #[serde(default)]
    pub parameters: Option<Vec<Value>>,
    /// Optional `search_path` for the session.
    #[serde(default)]
    pub schema: Option<String>,
    /// Ad-hoc connection; defaults to the server's own database.
    #[serde(default)]
    pub connection_string: Option<String>,
}

/// Diagnostic SQL passthrough.
///
/// Runs one statement against the engine database (or an ad-hoc
/// connection) and returns rows as JSON. Intended for operators debugging
/// a deployment, not as a data path.
#[utoipa::path(
    post,
    path = "/postgres/execute",
    request_body = PostgresExecuteRequest,
    responses(
        (status = 200, description = "Statement result"),
        (status = 400, description = "Bad request", body = super::ErrorResponse),
    ),
    tag = "admin",
)]
pub async fn postgres_execute(
    State(state): State<AppState>,
    Json(request): Json<PostgresExecuteRequest>,
) -> AppResult<Json<Value>> {
    let query = match (&request.query, &request.query_base64) {
        (_, Some(encoded)) => {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| AppError::Validation(format!("invalid query_base64: {e}")))?;
            String::from_utf8(bytes)
                .map_err(|e| AppError::Validation(format!("query is not utf-8: {e}")))?
        }
        (Some(query), None) => query.clone(),
        (None, None) => {
            return Err(AppError::Validation(
                "either `query` or `query_base64` is required".into(),
            ))
        }
    };

    let result = match &request.connection_string {
        Some(url) => {
            let mut conn = PgConnection::connect(url)
                .await
                .map_err(|e| AppError::Validation(format!("connect failed: {e}")))?;
            run_statement(&mut conn, &request, &query).await
        }
        None => {
            let pool = state.pool.as_ref().ok_or_else(|| {
                AppError::Validation(
                    "no database pool available; pass `connection_string`".into(),
                )
            })?;
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            run_statement(&mut conn, &request, &query).await
        }
    }?;

    Ok(Json(result))
}

async fn run_statement(
    conn: &mut PgConnection,
    request: &PostgresExecuteRequest,
    query: &str,
) -> AppResult<Value> {
    if let Some(schema) = &request.schema {
        if !schema.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(AppError::Validation("invalid schema name".into()));
        }
        sqlx::query(&format!("SET search_path TO {schema}"))
            .execute(&mut *conn)
            .await
            .map_err(|e| AppError::Validation(e.to_string()))?;
    }

    let mut prepared = sqlx::query(query);
    if let Some(parameters) = &request.parameters {
        for parameter in parameters {
            prepared = match parameter {
                Value::Null => prepared.bind(None::<String>),
                Value::Bool(b) => prepared.bind(*b),
                Value::Number(n) if n.is_i64() => prepared.bind(n.as_i64()),
                Value::Number(n) => prepared.bind(n.as_f64()),
                Value::String(s) => prepared.bind(s.clone()),
                other => prepared.bind(other.clone()),
            };
        }
    }

    let rows = prepared
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::Validation(format!("statement failed: {e}")))?;

    let data: Vec<Value> = rows.iter().map(row_to_json).collect();
    Ok(serde_json::json!({ "rows": data, "row_count": data.len() }))
}

fn row_to_json(row: &sqlx::postgres::PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let name = column.name();
        let value = match column.type_info().name() {
            "INT2" | "INT4" | "INT8" => row
                .try_get::<Option<i64>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" | "FLOAT8" => row
                .try_get::<Option<f64>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "BOOL" => row
                .try_get::<Option<bool>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(name).ok().flatten(),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_rfc3339())),
            _ => row
                .try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .map(Value::String),
        };
        object.insert(name.to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/queue/stats", get(queue_stats))
        .route("/workers", get(workers))
        .route("/postgres/execute", post(postgres_execute))
        .with_state(state)
}
