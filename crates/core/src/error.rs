//! Error taxonomy shared across the engine.
//!
//! Two layers live here:
//! - [`ErrorObject`] is the structured error attached to events (the
//!   `error_json` wire shape). It is what operators see.
//! - [`EngineError`] is the library error for core operations (parsing,
//!   rendering, scheduling decisions).

use serde::{Deserialize, Serialize};

/// Classification of failures surfaced in event `error_json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unresolved reference or type mismatch during rendering. Fatal to the
    /// step; never retried.
    TemplateError,

    /// Playbook or config rejected at registration or expansion. Fatal to
    /// the execution.
    ValidationError,

    /// Credential missing or rejected by an external system.
    AuthError,

    /// Transient I/O failure. Retried with backoff up to `max_attempts`.
    TransportError,

    /// External system returned a logical failure (SQL error, HTTP 4xx).
    ActionError,

    /// Deadline exceeded.
    Timeout,

    /// Cooperative cancellation.
    Cancelled,

    /// Lease expired without heartbeat; internal nack equivalent.
    LeaseExpired,

    /// Attempts exhausted; terminal.
    DeadLetter,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TemplateError => "template_error",
            Self::ValidationError => "validation_error",
            Self::AuthError => "auth_error",
            Self::TransportError => "transport_error",
            Self::ActionError => "action_error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::LeaseExpired => "lease_expired",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Default retry policy: only transport failures and timeouts retry.
    /// Actions that declare themselves safely retryable widen this to
    /// [`ErrorKind::ActionError`] at the worker.
    pub fn default_retryable(&self) -> bool {
        matches!(self, Self::TransportError | Self::Timeout | Self::LeaseExpired)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error recorded on events.
///
/// Secrets must never appear in `message` or `source_system`; callers build
/// messages from classified failures, not raw payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
    pub retryable: bool,
    #[serde(default)]
    pub attempt_count: i32,
}

impl ErrorObject {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source_system: None,
            retryable: kind.default_retryable(),
            attempt_count: 0,
        }
    }

    pub fn template(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TemplateError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportError, message)
    }

    pub fn action(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActionError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn dead_letter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadLetter, message)
    }

    pub fn with_source(mut self, source_system: impl Into<String>) -> Self {
        self.source_system = Some(source_system.into());
        self
    }

    pub fn with_attempt(mut self, attempt_count: i32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Library error for core operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rendering failed: unresolved name, type mismatch, bad expression.
    #[error("template error: {0}")]
    Template(String),

    /// Structural problem in a playbook or action configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// A routing edge or reference names a step that does not exist.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Template(_) => ErrorKind::TemplateError,
            Self::Validation(_) | Self::UnknownStep(_) => ErrorKind::ValidationError,
            Self::Serialization(_) => ErrorKind::ValidationError,
        }
    }

    /// Convert into the wire shape attached to a failure event.
    pub fn to_object(&self) -> ErrorObject {
        ErrorObject::new(self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TemplateError).unwrap();
        assert_eq!(json, "\"template_error\"");
        let parsed: ErrorKind = serde_json::from_str("\"dead_letter\"").unwrap();
        assert_eq!(parsed, ErrorKind::DeadLetter);
    }

    #[test]
    fn default_retryability() {
        assert!(ErrorKind::TransportError.default_retryable());
        assert!(ErrorKind::Timeout.default_retryable());
        assert!(!ErrorKind::TemplateError.default_retryable());
        assert!(!ErrorKind::ActionError.default_retryable());
        assert!(!ErrorKind::DeadLetter.default_retryable());
    }

    #[test]
    fn error_object_round_trip() {
        let error = ErrorObject::transport("connection reset")
            .with_source("postgres")
            .with_attempt(2);

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ErrorObject = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
        assert!(parsed.retryable);
    }

    #[test]
    fn engine_error_maps_to_object() {
        let err = EngineError::Template("undefined name `x`".to_string());
        let obj = err.to_object();
        assert_eq!(obj.kind, ErrorKind::TemplateError);
        assert!(!obj.retryable);
    }
}
