//! # playmill-server
//!
//! The control plane of the playmill orchestrator: the broker daemon
//! driving the scheduling state machine, the sub-playbook composer, and
//! the HTTP API for catalog, executions, events and credentials.

pub mod api;
pub mod broker;
pub mod composer;
pub mod config;
pub mod error;
pub mod services;

use axum::Router;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use api::AppState;
pub use broker::{reaper_loop, BrokerDaemon};
pub use composer::Composer;
pub use config::{BrokerConfig, ServerConfig};
pub use error::{AppError, AppResult};

/// OpenAPI description of the control plane.
#[derive(OpenApi)]
#[openapi(
    paths(
        api::catalog::register,
        api::catalog::get_entry,
        api::catalog::list,
        api::executions::execute,
        api::executions::cancel,
        api::executions::snapshot,
        api::executions::list,
        api::executions::events,
        api::credentials::create,
        api::credentials::get_one,
        api::credentials::list,
        api::admin::health,
        api::admin::queue_stats,
        api::admin::workers,
        api::admin::postgres_execute,
    ),
    components(schemas(
        api::ErrorResponse,
        api::catalog::RegisterRequest,
        api::catalog::RegisterResponse,
        api::catalog::CatalogEntryResponse,
        api::executions::ExecuteRequest,
        api::executions::ExecuteResponse,
        api::executions::CancelResponse,
        api::executions::EventPage,
        api::credentials::CreateCredentialRequest,
        api::credentials::CredentialResponse,
        api::admin::HealthResponse,
        api::admin::PostgresExecuteRequest,
    )),
    tags(
        (name = "catalog", description = "Playbook registration and lookup"),
        (name = "executions", description = "Execution lifecycle and event streams"),
        (name = "credentials", description = "Credential management"),
        (name = "admin", description = "Operational endpoints"),
    ),
    info(
        title = "Playmill API",
        description = "Control plane for the playmill workflow orchestrator",
    )
)]
pub struct ApiDoc;

/// Assemble the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::catalog::routes(state.clone()))
        .merge(api::executions::routes(state.clone()))
        .merge(api::credentials::routes(state.clone()))
        .merge(api::admin::routes(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}
