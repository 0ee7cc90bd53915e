//! Catalog endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

use super::{AppState, ListResponse};

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    /// Playbook YAML.
    #[serde(default)]
    pub content: Option<String>,
    /// Base64-encoded playbook YAML; wins over `content` when both are
    /// present.
    #[serde(default)]
    pub content_base64: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub path: String,
    pub version: i32,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CatalogEntryResponse {
    pub path: String,
    pub version: i32,
    pub content: String,
    /// Condensed structural description of the parsed playbook.
    #[schema(value_type = Object)]
    pub parsed_summary: Value,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
}

/// Register a playbook revision.
///
/// Accepts either a JSON body with `content`/`content_base64` or the raw
/// YAML document itself.
#[utoipa::path(
    post,
    path = "/catalog/register",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Registered", body = RegisterResponse),
        (status = 400, description = "Structural validation failed", body = super::ErrorResponse),
    ),
    tag = "catalog",
)]
pub async fn register(
    State(state): State<AppState>,
    body: String,
) -> AppResult<Json<RegisterResponse>> {
    let content = extract_content(&body)?;
    let registered = state.catalog.register(&content).await?;
    Ok(Json(RegisterResponse {
        path: registered.path,
        version: registered.version,
        warnings: registered.warnings,
    }))
}

/// Fetch a playbook revision. The trailing segment is the version number
/// or `latest`; the rest of the wildcard is the catalog path.
#[utoipa::path(
    get,
    path = "/catalog/{path}/{version}",
    responses(
        (status = 200, description = "Catalog entry", body = CatalogEntryResponse),
        (status = 404, description = "Unknown path or version", body = super::ErrorResponse),
    ),
    tag = "catalog",
)]
pub async fn get_entry(
    State(state): State<AppState>,
    Path(rest): Path<String>,
) -> AppResult<Json<CatalogEntryResponse>> {
    let (path, version) = split_path_version(&rest)?;
    let record = state.catalog.get(path, version).await?;
    Ok(Json(CatalogEntryResponse {
        path: record.path,
        version: record.version,
        content: record.content,
        parsed_summary: record.parsed,
    }))
}

/// List the latest version of every playbook, optionally filtered by a
/// path prefix.
#[utoipa::path(
    get,
    path = "/catalog",
    params(("prefix" = Option<String>, Query, description = "Path prefix filter")),
    responses((status = 200, description = "Catalog listing")),
    tag = "catalog",
)]
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<ListResponse<Value>>> {
    let entries = state.catalog.list(query.prefix.as_deref()).await?;
    let data = entries
        .into_iter()
        .map(|entry| serde_json::to_value(entry).unwrap_or(Value::Null))
        .collect();
    Ok(Json(ListResponse { data }))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/catalog/register", post(register))
        .route("/catalog", get(list))
        .route("/catalog/*rest", get(get_entry))
        .with_state(state)
}

fn extract_content(body: &str) -> AppResult<String> {
    if let Ok(request) = serde_json::from_str::<RegisterRequest>(body) {
        if let Some(encoded) = request.content_base64 {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| AppError::Validation(format!("invalid content_base64: {e}")))?;
            return String::from_utf8(bytes)
                .map_err(|e| AppError::Validation(format!("content is not utf-8: {e}")));
        }
        if let Some(content) = request.content {
            return Ok(content);
        }
    }
    if body.trim().is_empty() {
        return Err(AppError::Validation("empty playbook body".into()));
    }
    // Raw YAML document.
    Ok(body.to_string())
}

fn split_path_version(rest: &str) -> AppResult<(&str, Option<i32>)> {
    let (path, version) = rest.rsplit_once('/').ok_or_else(|| {
        AppError::Validation("expected /catalog/{path}/{version}".into())
    })?;
    if path.is_empty() {
        return Err(AppError::Validation("empty catalog path".into()));
    }
    match version {
        "latest" => Ok((path, None)),
        number => number
            .parse::<i32>()
            .map(|v| (path, Some(v)))
            .map_err(|_| {
                AppError::Validation(format!(
                    "version must be a number or `latest`, got `{number}`"
                ))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parses_versions_and_latest() {
        assert_eq!(
            split_path_version("demo/weather/3").unwrap(),
            ("demo/weather", Some(3))
        );
        assert_eq!(
            split_path_version("demo/weather/latest").unwrap(),
            ("demo/weather", None)
        );
        assert!(split_path_version("plainpath").is_err());
        assert!(split_path_version("demo/weather/new").is_err());
    }

    #[test]
    fn content_extraction_prefers_base64() {
        let yaml = "apiVersion: playmill/v1";
        let encoded = BASE64.encode(yaml);
        let body = format!("{{\"content_base64\": \"{encoded}\"}}");
        assert_eq!(extract_content(&body).unwrap(), yaml);

        let body = "{\"content\": \"kind: Playbook\"}";
        assert_eq!(extract_content(body).unwrap(), "kind: Playbook");

        // Raw YAML passes through untouched.
        assert_eq!(extract_content(yaml).unwrap(), yaml);
    }
}
