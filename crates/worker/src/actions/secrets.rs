//! Secrets action: verifies a named credential exists and surfaces its
//! metadata. The payload itself never enters the result — downstream
//! steps reference the credential by name and workers resolve it at
//! render time.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use playmill_core::{ActionKind, ErrorObject};
use playmill_store::EngineStore;

use super::{Action, ActionInvocation};

pub struct SecretsAction {
    store: Arc<dyn EngineStore>,
}

impl SecretsAction {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Action for SecretsAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Secrets
    }

    fn safely_retryable(&self) -> bool {
        true
    }

    async fn invoke(&self, invocation: ActionInvocation) -> Result<Value, ErrorObject> {
        let name = invocation.config_str("name").ok_or_else(|| {
            ErrorObject::validation("secrets action requires `name`").with_retryable(false)
        })?;

        let record = self
            .store
            .get_credential(name)
            .await
            .map_err(|e| ErrorObject::transport(e.to_string()).with_source("credential_store"))?
            .ok_or_else(|| {
                ErrorObject::auth(format!("credential `{name}` not found")).with_retryable(false)
            })?;

        Ok(json!({
            "name": record.name,
            "kind": record.kind,
            "present": true,
        }))
    }
}
