//! Execution lifecycle operations: start, cancel, snapshot, event pages.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};

use playmill_core::event::{EventStatus, EventType, NewEvent};
use playmill_core::playbook::JsonMap;
use playmill_core::render::{ContextLayers, LayerKind};
use playmill_core::{ErrorObject, Event, ExecutionStatus, Snapshot, TemplateEngine};
use playmill_store::{EngineStore, ExecutionFilter, ExecutionRecord, NewExecution, ParentLink};

use crate::error::{AppError, AppResult};

/// Request to start an execution.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub path: String,
    pub version: Option<i32>,
    pub payload: Value,
    /// true: deep-merge the payload over the playbook's rendered workload
    /// defaults. false: the payload replaces the workload wholesale.
    pub merge: bool,
    pub parent: Option<ParentLink>,
}

#[derive(Clone)]
pub struct ExecutionService {
    store: Arc<dyn EngineStore>,
    engine: Arc<TemplateEngine>,
}

impl ExecutionService {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self {
            store,
            engine: Arc::new(TemplateEngine::new()),
        }
    }

    /// Bind a playbook version, render its workload against the request
    /// payload and create the execution with its `execution_start` event.
    #[instrument(skip(self, request), fields(path = %request.path))]
    pub async fn start(&self, request: StartRequest) -> AppResult<ExecutionRecord> {
        let catalog = self
            .store
            .get_playbook(&request.path, request.version)
            .await?;
        let parsed = playmill_core::playbook::parse(&catalog.content)?;

        // The workload is rendered once, against the payload, and becomes
        // the base context layer for every later rendering cycle.
        let mut payload_layer = JsonMap::new();
        payload_layer.insert("payload".to_string(), request.payload.clone());
        if let Value::Object(fields) = &request.payload {
            for (key, value) in fields {
                payload_layer.insert(key.clone(), value.clone());
            }
        }
        let layers = ContextLayers::new().push(LayerKind::Workload, payload_layer);
        let mut workload = self
            .engine
            .render_map(&parsed.playbook.workload, &layers)?;

        match (&request.payload, request.merge) {
            (Value::Object(overrides), true) => deep_merge(&mut workload, overrides),
            (Value::Object(overrides), false) => {
                workload = overrides.clone();
            }
            _ => {}
        }

        let record = self
            .store
            .create_execution(NewExecution {
                path: catalog.path.clone(),
                version: catalog.version,
                parent: request.parent,
            })
            .await?;

        self.store
            .append_events(vec![NewEvent::new(
                record.execution_id,
                EventType::ExecutionStart,
                EventStatus::Started,
            )
            .with_payload(serde_json::json!({
                "path": catalog.path,
                "version": catalog.version,
                "workload": workload,
            }))])
            .await?;

        info!(
            execution_id = record.execution_id,
            version = catalog.version,
            "execution created"
        );
        Ok(record)
    }

    /// Cooperative cancellation: record the terminal event, withdraw ready
    /// work, and leave leased entries to finish on their own — their
    /// outcomes are recorded but never scheduled on.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: i64) -> AppResult<()> {
        let record = self.store.get_execution(execution_id).await?;
        if record.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "execution {execution_id} is already {}",
                record.status
            )));
        }

        self.store
            .append_events(vec![NewEvent::new(
                execution_id,
                EventType::ExecutionFailed,
                EventStatus::Cancelled,
            )
            .with_error(ErrorObject::cancelled("cancelled by request"))])
            .await?;
        let removed = self.store.cancel_ready_entries(execution_id, None).await?;
        self.store
            .set_execution_status(execution_id, ExecutionStatus::Cancelled)
            .await?;

        info!(execution_id, removed, "execution cancelled");
        Ok(())
    }

    /// Current state, reconstructed from the event stream.
    pub async fn snapshot(&self, execution_id: i64) -> AppResult<Snapshot> {
        // Ensure a 404 for executions that never existed.
        self.store.get_execution(execution_id).await?;
        let events = self.store.load_events(execution_id, None, None).await?;
        Ok(Snapshot::fold(execution_id, &events))
    }

    pub async fn events(
        &self,
        execution_id: i64,
        since: Option<i64>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Event>> {
        self.store.get_execution(execution_id).await?;
        Ok(self
            .store
            .load_events(execution_id, since, limit.map(|l| l.clamp(1, 10_000)))
            .await?)
    }

    pub async fn get(&self, execution_id: i64) -> AppResult<ExecutionRecord> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    pub async fn list(&self, filter: ExecutionFilter) -> AppResult<Vec<ExecutionRecord>> {
        Ok(self.store.list_executions(filter).await?)
    }
}

/// Recursively merge `overrides` into `base`; scalars and arrays replace,
/// objects merge per key.
fn deep_merge(base: &mut JsonMap, overrides: &JsonMap) {
    for (key, incoming) in overrides {
        match (base.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), incoming.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_map(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let mut base = to_map(json!({
            "region": "eu",
            "db": {"host": "localhost", "port": 5432},
            "cities": ["a"],
        }));
        let overrides = to_map(json!({
            "region": "us",
            "db": {"port": 5433},
            "cities": ["b", "c"],
        }));

        deep_merge(&mut base, &overrides);
        assert_eq!(
            Value::Object(base),
            json!({
                "region": "us",
                "db": {"host": "localhost", "port": 5433},
                "cities": ["b", "c"],
            })
        );
    }
}
