//! Credential endpoints. Secret material flows in once at registration
//! and never back out: reads return metadata only.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

use super::{AppState, ListResponse};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCredentialRequest {
    pub name: String,
    /// Credential kind: postgres, hmac, oauth, service_account, bearer.
    pub kind: String,
    /// Secret payload; encrypted at rest and never returned by reads.
    #[schema(value_type = Object)]
    pub payload: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CredentialResponse {
    pub name: String,
    pub kind: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Store a credential.
#[utoipa::path(
    post,
    path = "/credentials",
    request_body = CreateCredentialRequest,
    responses((status = 200, description = "Stored")),
    tag = "credentials",
)]
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateCredentialRequest>,
) -> AppResult<Json<Value>> {
    if request.name.is_empty() {
        return Err(AppError::Validation("credential name must not be empty".into()));
    }
    state
        .store
        .put_credential(&request.name, &request.kind, request.payload)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true, "name": request.name })))
}

/// Credential metadata. Never returns secret material.
#[utoipa::path(
    get,
    path = "/credentials/{name}",
    responses(
        (status = 200, description = "Metadata", body = CredentialResponse),
        (status = 404, description = "Unknown credential", body = super::ErrorResponse),
    ),
    tag = "credentials",
)]
pub async fn get_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<CredentialResponse>> {
    let summary = state
        .store
        .list_credentials()
        .await?
        .into_iter()
        .find(|summary| summary.name == name)
        .ok_or_else(|| AppError::NotFound(format!("credential `{name}` not found")))?;
    Ok(Json(CredentialResponse {
        name: summary.name,
        kind: summary.kind,
        created_at: summary.created_at,
    }))
}

/// List credential metadata.
#[utoipa::path(
    get,
    path = "/credentials",
    responses((status = 200, description = "Credential listing")),
    tag = "credentials",
)]
pub async fn list(
    State(state): State<AppState>,
) -> AppResult<Json<ListResponse<CredentialResponse>>> {
    let data = state
        .store
        .list_credentials()
        .await?
        .into_iter()
        .map(|summary| CredentialResponse {
            name: summary.name,
            kind: summary.kind,
            created_at: summary.created_at,
        })
        .collect();
    Ok(Json(ListResponse { data }))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/credentials", post(create).get(list))
        .route("/credentials/:name", get(get_one))
        .with_state(state)
}
