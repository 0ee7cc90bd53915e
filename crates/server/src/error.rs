//! Control-plane error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use playmill_core::EngineError;
use playmill_store::StoreError;

/// Error surfaced by services and API handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Process exit code contract for CLI front-ends built on this API:
    /// 0 success, 1 generic error, 2 validation error, 3 not found,
    /// 4 timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::NotFound(_) => 3,
            Self::Timeout(_) => 4,
            Self::Conflict(_) | Self::Internal(_) => 1,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ExecutionNotFound(_)
            | StoreError::EntryNotFound(_)
            | StoreError::PlaybookNotFound { .. } => Self::NotFound(e.to_string()),
            StoreError::Conflict(_) | StoreError::LeaseLost(_) => Self::Conflict(e.to_string()),
            StoreError::Encryption(message) => Self::Validation(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Validation(_) | EngineError::UnknownStep(_) => {
                Self::Validation(e.to_string())
            }
            EngineError::Template(_) => Self::Validation(e.to_string()),
            EngineError::Serialization(_) => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(AppError::Validation("x".into()).exit_code(), 2);
        assert_eq!(AppError::NotFound("x".into()).exit_code(), 3);
        assert_eq!(AppError::Timeout("x".into()).exit_code(), 4);
        assert_eq!(AppError::Internal("x".into()).exit_code(), 1);
    }

    #[test]
    fn store_not_found_maps_to_404() {
        let error: AppError = StoreError::ExecutionNotFound(9).into();
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }
}
