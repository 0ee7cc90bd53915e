//! The action interface.
//!
//! The engine depends on exactly one contract: [`Action::invoke`] with a
//! rendered configuration, an opaque secret handle, a deadline and a
//! progress callback. Concrete action kinds are wired into an
//! [`ActionRegistry`] at build time, keyed by [`ActionKind`]; there is no
//! dynamic loading and no reflection. Kinds that are not wired into this
//! worker build fail with a non-retryable `action_error`.

mod http;
mod noop;
mod postgres;
mod secrets;
mod shell;

pub use http::HttpAction;
pub use noop::NoopAction;
pub use postgres::PostgresAction;
pub use secrets::SecretsAction;
pub use shell::{PythonAction, ShellAction};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use playmill_core::playbook::JsonMap;
use playmill_core::{ActionKind, ErrorObject};
use playmill_store::EngineStore;

/// Opaque handle around decrypted credential material. Deliberately
/// unreadable through `Debug`/`Display` so secrets cannot leak through
/// logging; actions call [`expose`](SecretHandle::expose) at the point of
/// use.
#[derive(Clone)]
pub struct SecretHandle {
    payload: Arc<Value>,
    kind: String,
}

impl SecretHandle {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            payload: Arc::new(payload),
            kind: kind.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The decrypted payload. Must not be written to events or logs.
    pub fn expose(&self) -> &Value {
        &self.payload
    }

    /// Convenience accessor for string fields of the payload.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

impl std::fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretHandle(kind={}, ..)", self.kind)
    }
}

/// Fire-and-forget progress channel. Reports are drained by the worker
/// slot and appended as informational events; they never affect state.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<(String, Value)>,
}

impl ProgressSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, kind: impl Into<String>, payload: Value) {
        let _ = self.tx.send((kind.into(), payload));
    }
}

/// Everything an action receives for one invocation.
pub struct ActionInvocation {
    pub kind: ActionKind,
    /// Fully rendered configuration: the step's templated inputs merged
    /// over the task's base config.
    pub config: JsonMap,
    /// Rendered context the configuration was produced from, for actions
    /// that need ambient values.
    pub context: Value,
    pub secret: Option<SecretHandle>,
    /// Deadline the action must honour; the runtime also enforces it from
    /// the outside.
    pub deadline: Duration,
    pub execution_id: i64,
    pub node_id: String,
    pub attempt: i32,
    pub progress: ProgressSender,
}

impl ActionInvocation {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// A pluggable action kind.
#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Whether the engine may retry this action on a logical
    /// (`action_error`) failure. Transport failures and timeouts are
    /// retried regardless.
    fn safely_retryable(&self) -> bool {
        false
    }

    /// Perform the side effect. Return an [`ErrorObject`] whose kind and
    /// `retryable` flag drive the propagation policy.
    async fn invoke(&self, invocation: ActionInvocation) -> Result<Value, ErrorObject>;
}

/// Build-time map of action kinds to implementations.
pub struct ActionRegistry {
    actions: HashMap<ActionKind, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Registry with the built-in actions wired: noop, http, postgres,
    /// shell, python and secrets. duckdb, snowflake, snowflake_transfer
    /// and container stay external; register them explicitly when the
    /// deployment links them in.
    pub fn with_builtins(store: Arc<dyn EngineStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NoopAction));
        registry.register(Arc::new(HttpAction::new()));
        registry.register(Arc::new(PostgresAction));
        registry.register(Arc::new(ShellAction));
        registry.register(Arc::new(PythonAction));
        registry.register(Arc::new(SecretsAction::new(store)));
        registry
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.kind(), action);
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn Action>> {
        self.actions.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.actions.keys().copied().collect()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
