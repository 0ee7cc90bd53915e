//! HTTP API: shared state and DTOs.

pub mod admin;
pub mod catalog;
pub mod credentials;
pub mod executions;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;

use playmill_store::EngineStore;

use crate::services::{CatalogService, ExecutionService};

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EngineStore>,
    pub catalog: CatalogService,
    pub executions: ExecutionService,
    /// Raw pool for the diagnostic passthrough; absent when the server is
    /// not backed by PostgreSQL (tests).
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(store: Arc<dyn EngineStore>, pool: Option<PgPool>) -> Self {
        let catalog = CatalogService::new(store.clone());
        let executions = ExecutionService::new(store.clone());
        Self {
            store,
            catalog,
            executions,
            pool,
        }
    }
}

/// Standard error body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response wrapper for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}
