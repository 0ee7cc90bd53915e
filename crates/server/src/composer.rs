//! Sub-playbook composition.
//!
//! A sub-playbook step starts a child execution bound to the referenced
//! playbook version; the step stays started until the child terminates.
//! On the child's terminal event, its aggregated result (optionally
//! scoped to a `return_step`) is mirrored into the parent's stream as a
//! `subplaybook_completed` — or a `step_failed` when the child failed —
//! which the parent's broker then routes like any other step outcome.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};

use playmill_core::broker::ChildSpec;
use playmill_core::event::{EventStatus, EventType, NewEvent};
use playmill_core::{ErrorKind, ErrorObject, ExecutionStatus, Snapshot};
use playmill_store::{EngineStore, ExecutionRecord, ParentLink};

use crate::error::AppResult;
use crate::services::{ExecutionService, StartRequest};

#[derive(Clone)]
pub struct Composer {
    store: Arc<dyn EngineStore>,
    executions: ExecutionService,
}

impl Composer {
    pub fn new(store: Arc<dyn EngineStore>, executions: ExecutionService) -> Self {
        Self { store, executions }
    }

    /// Create the child execution and return the `subplaybook_invoked`
    /// event for the parent's stream.
    #[instrument(skip(self, child), fields(parent = parent.execution_id, path = %child.path))]
    pub async fn spawn_child(
        &self,
        parent: &ExecutionRecord,
        child: &ChildSpec,
    ) -> AppResult<NewEvent> {
        let record = self
            .executions
            .start(StartRequest {
                path: child.path.clone(),
                version: child.version,
                payload: child.payload.clone(),
                merge: true,
                parent: Some(ParentLink {
                    execution_id: parent.execution_id,
                    root_execution_id: parent.root_execution_id,
                    step: child.step.clone(),
                    iterator_index: None,
                }),
            })
            .await?;

        info!(
            child_execution_id = record.execution_id,
            "child execution created"
        );

        Ok(NewEvent::new(
            parent.execution_id,
            EventType::SubplaybookInvoked,
            EventStatus::Started,
        )
        .with_node(child.step.clone())
        .with_parent(child.parent_event_id)
        .with_payload(serde_json::json!({
            "child_execution_id": record.execution_id,
            "path": record.path,
            "version": record.version,
        })))
    }

    /// Mirror a terminated child into its parent's stream. Idempotent:
    /// the mirrored events deduplicate like any other append.
    #[instrument(skip(self, child, snapshot), fields(child = child.execution_id))]
    pub async fn mirror_to_parent(
        &self,
        child: &ExecutionRecord,
        snapshot: &Snapshot,
        return_step: Option<&str>,
    ) -> AppResult<()> {
        let Some(parent_execution_id) = child.parent_execution_id else {
            return Ok(());
        };
        let step = child.parent_step.clone().unwrap_or_default();

        let mirror = match snapshot.status {
            ExecutionStatus::Completed => {
                let result = aggregate_result(snapshot, return_step);
                NewEvent::new(
                    parent_execution_id,
                    EventType::SubplaybookCompleted,
                    EventStatus::Success,
                )
                .with_node(step)
                .with_payload(serde_json::json!({
                    "child_execution_id": child.execution_id,
                    "result": result,
                }))
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                let error = snapshot.error.clone().unwrap_or_else(|| {
                    ErrorObject::new(ErrorKind::ActionError, "sub-playbook failed")
                });
                NewEvent::new(parent_execution_id, EventType::StepFailed, EventStatus::Failed)
                    .with_node(step)
                    .with_payload(serde_json::json!({
                        "child_execution_id": child.execution_id,
                    }))
                    .with_error(error)
            }
            // Not terminal yet; nothing to mirror.
            _ => return Ok(()),
        };

        self.store.append_events(vec![mirror]).await?;
        info!(parent_execution_id, "mirrored child outcome into parent");
        Ok(())
    }
}

/// The child's final result: the named step's result when `return_step`
/// is set, otherwise the map of every step result.
fn aggregate_result(snapshot: &Snapshot, return_step: Option<&str>) -> Value {
    match return_step {
        Some(step) => snapshot.step_result(step).cloned().unwrap_or(Value::Null),
        None => {
            let results: serde_json::Map<String, Value> = snapshot
                .steps
                .iter()
                .filter_map(|(name, step)| {
                    step.result.as_ref().map(|r| (name.clone(), r.clone()))
                })
                .collect();
            Value::Object(results)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playmill_core::state::{StepSnapshot, StepStatus};
    use serde_json::json;

    fn snapshot_with_results() -> Snapshot {
        let mut snapshot = Snapshot::new(2);
        snapshot.status = ExecutionStatus::Completed;
        for (name, result) in [("compute", json!({"sum": 10})), ("end", Value::Null)] {
            snapshot.steps.insert(
                name.to_string(),
                StepSnapshot {
                    status: StepStatus::Completed,
                    result: Some(result),
                    error: None,
                    attempt: 0,
                    local_args: Default::default(),
                    iterator: None,
                    child_execution_id: None,
                    save_status: None,
                    started_at: None,
                    ended_at: None,
                },
            );
        }
        snapshot
    }

    #[test]
    fn return_step_scopes_the_aggregate() {
        let snapshot = snapshot_with_results();
        assert_eq!(
            aggregate_result(&snapshot, Some("compute")),
            json!({"sum": 10})
        );
        assert_eq!(aggregate_result(&snapshot, Some("missing")), Value::Null);
    }

    #[test]
    fn unscoped_aggregate_maps_all_results() {
        let snapshot = snapshot_with_results();
        let aggregate = aggregate_result(&snapshot, None);
        assert_eq!(aggregate["compute"], json!({"sum": 10}));
    }
}
