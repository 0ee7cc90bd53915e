//! No-op action: echoes its rendered configuration as the result.
//!
//! Useful for wiring tests and as a placeholder step while authoring
//! playbooks.

use async_trait::async_trait;
use serde_json::Value;

use playmill_core::{ActionKind, ErrorObject};

use super::{Action, ActionInvocation};

pub struct NoopAction;

#[async_trait]
impl Action for NoopAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Noop
    }

    fn safely_retryable(&self) -> bool {
        true
    }

    async fn invoke(&self, invocation: ActionInvocation) -> Result<Value, ErrorObject> {
        Ok(Value::Object(invocation.config))
    }
}
