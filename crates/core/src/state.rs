//! Execution state reconstruction.
//!
//! A [`Snapshot`] is the pure fold of one execution's event stream. The
//! broker keeps no state in memory that cannot be regenerated from events:
//! after a restart it re-folds and continues. The fold is deterministic —
//! the same stream always produces the same snapshot — and incremental:
//! `fold(events ++ [e])` equals `apply(fold(events), e)`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, ErrorObject};
use crate::event::{Event, EventStatus, EventType};
use crate::playbook::{IterMode, JsonMap};
use crate::render::{ContextLayers, LayerKind};

/// High-level execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Status of one workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Started,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// How a variable entered the variables store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    UserDefined,
    StepResult,
    Computed,
    IteratorState,
}

/// One entry of the per-execution variables store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub value: Value,
    pub kind: VariableKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
}

/// Per-iteration bookkeeping for an iterator step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorState {
    pub mode: IterMode,
    pub element: String,
    pub expected: usize,
    /// The rendered collection, kept so sequential scheduling and recovery
    /// never re-render against a context that may have moved on.
    pub items: Vec<Value>,
    pub results: BTreeMap<i32, Value>,
    pub failed: BTreeMap<i32, ErrorObject>,
    pub completed: bool,
}

impl IteratorState {
    pub fn done_count(&self) -> usize {
        self.results.len() + self.failed.len()
    }

    pub fn all_indices_terminal(&self) -> bool {
        self.done_count() >= self.expected
    }

    /// Per-iteration results in original index order, regardless of the
    /// order completions arrived in.
    pub fn ordered_results(&self) -> Vec<Value> {
        self.results.values().cloned().collect()
    }
}

/// Reconstructed state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub attempt: i32,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub local_args: JsonMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterator: Option<IteratorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_execution_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_status: Option<EventStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepSnapshot {
    fn new() -> Self {
        Self {
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempt: 0,
            local_args: JsonMap::new(),
            iterator: None,
            child_execution_id: None,
            save_status: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// The fold of an execution's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub execution_id: i64,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub workload: JsonMap,
    pub steps: HashMap<String, StepSnapshot>,
    pub variables: HashMap<String, Variable>,
    pub cancelled: bool,
    pub last_event_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(execution_id: i64) -> Self {
        Self {
            execution_id,
            status: ExecutionStatus::Pending,
            path: None,
            version: None,
            workload: JsonMap::new(),
            steps: HashMap::new(),
            variables: HashMap::new(),
            cancelled: false,
            last_event_id: 0,
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Fold a full event stream.
    pub fn fold(execution_id: i64, events: &[Event]) -> Self {
        let mut snapshot = Self::new(execution_id);
        for event in events {
            snapshot.apply(event);
        }
        snapshot
    }

    /// Apply a single event. This is the incremental step of the fold.
    pub fn apply(&mut self, event: &Event) {
        self.last_event_id = self.last_event_id.max(event.event_id);

        match event.event_type {
            EventType::ExecutionStart => {
                self.status = ExecutionStatus::Running;
                self.started_at = Some(event.timestamp);
                if let Some(path) = event.payload.get("path").and_then(Value::as_str) {
                    self.path = Some(path.to_string());
                }
                if let Some(version) = event.payload.get("version").and_then(Value::as_i64) {
                    self.version = Some(version as i32);
                }
                if let Some(Value::Object(workload)) = event.payload.get("workload") {
                    self.workload = workload.clone();
                }
            }
            EventType::ExecutionCompleted => {
                self.status = ExecutionStatus::Completed;
                self.ended_at = Some(event.timestamp);
                self.result = event.result().cloned();
            }
            EventType::ExecutionFailed => {
                let cancelled = event
                    .error
                    .as_ref()
                    .map(|e| e.kind == ErrorKind::Cancelled)
                    .unwrap_or(false);
                self.status = if cancelled {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                self.cancelled |= cancelled;
                self.ended_at = Some(event.timestamp);
                self.error = event.error.clone();
            }
            EventType::StepStarted => {
                if let Some((name, false)) = split_node(event) {
                    let step = self.step_entry(name);
                    // A terminal outcome is never downgraded by a late or
                    // replayed start.
                    if !step.status.is_terminal() {
                        step.status = StepStatus::Started;
                        step.started_at.get_or_insert(event.timestamp);
                        step.attempt = step.attempt.max(event.attempt);
                    }
                }
            }
            EventType::StepCompleted => {
                if let Some((name, false)) = split_node(event) {
                    let result = event.result().cloned();
                    let name = name.to_string();
                    {
                        let step = self.step_entry(&name);
                        step.status = StepStatus::Completed;
                        step.result = result.clone();
                        step.ended_at = Some(event.timestamp);
                    }
                    self.record_step_result(&name, result, event.timestamp);
                }
            }
            EventType::StepFailed => {
                if let Some((name, false)) = split_node(event) {
                    let name = name.to_string();
                    match event.iterator_index {
                        // A per-iteration failure accumulates in the
                        // iterator state; the iterator step itself fails
                        // when the broker folds that in.
                        Some(index) => {
                            let step = self.step_entry(&name);
                            if let Some(iterator) = step.iterator.as_mut() {
                                if let Some(error) = event.error.clone() {
                                    iterator.failed.insert(index, error);
                                }
                            } else {
                                step.status = StepStatus::Failed;
                                step.error = event.error.clone();
                                step.ended_at = Some(event.timestamp);
                            }
                        }
                        None => {
                            let step = self.step_entry(&name);
                            step.status = StepStatus::Failed;
                            step.error = event.error.clone();
                            step.ended_at = Some(event.timestamp);
                        }
                    }
                }
            }
            EventType::StepSkipped => {
                if let Some((name, false)) = split_node(event) {
                    let step = self.step_entry(name);
                    step.status = StepStatus::Skipped;
                    step.ended_at = Some(event.timestamp);
                }
            }
            EventType::ActionStarted => {
                if let Some((name, false)) = split_node(event) {
                    let step = self.step_entry(name);
                    step.attempt = step.attempt.max(event.attempt);
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Started;
                    }
                }
            }
            // Step transitions for action outcomes are decided by the
            // broker, which appends the corresponding step events.
            EventType::ActionCompleted | EventType::ActionFailed => {
                if let Some((name, false)) = split_node(event) {
                    let step = self.step_entry(name);
                    step.attempt = step.attempt.max(event.attempt);
                }
            }
            EventType::IteratorExpanded => {
                if let Some((name, false)) = split_node(event) {
                    let expected = event
                        .payload
                        .get("count")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                    let mode = event
                        .payload
                        .get("mode")
                        .and_then(|m| serde_json::from_value(m.clone()).ok())
                        .unwrap_or_default();
                    let element = event
                        .payload
                        .get("element")
                        .and_then(Value::as_str)
                        .unwrap_or("item")
                        .to_string();
                    let items = event
                        .payload
                        .get("items")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let step = self.step_entry(name);
                    step.iterator = Some(IteratorState {
                        mode,
                        element,
                        expected,
                        items,
                        results: BTreeMap::new(),
                        failed: BTreeMap::new(),
                        completed: false,
                    });
                }
            }
            EventType::IteratorIterationCompleted => {
                if let (Some((name, false)), Some(index)) = (split_node(event), event.iterator_index)
                {
                    let result = event.result().cloned().unwrap_or(Value::Null);
                    let step = self.step_entry(name);
                    if let Some(iterator) = step.iterator.as_mut() {
                        iterator.results.insert(index, result);
                    }
                }
            }
            EventType::IteratorCompleted => {
                if let Some((name, false)) = split_node(event) {
                    let result = event.result().cloned();
                    let name = name.to_string();
                    {
                        let step = self.step_entry(&name);
                        if let Some(iterator) = step.iterator.as_mut() {
                            iterator.completed = true;
                        }
                        step.status = StepStatus::Completed;
                        step.result = result.clone();
                        step.ended_at = Some(event.timestamp);
                    }
                    self.record_step_result(&name, result, event.timestamp);
                }
            }
            EventType::SubplaybookInvoked => {
                if let Some((name, false)) = split_node(event) {
                    let child = event
                        .payload
                        .get("child_execution_id")
                        .and_then(Value::as_i64);
                    self.step_entry(name).child_execution_id = child;
                }
            }
            EventType::SubplaybookCompleted => {
                if let Some((name, false)) = split_node(event) {
                    let result = event.result().cloned();
                    let name = name.to_string();
                    {
                        let step = self.step_entry(&name);
                        step.status = StepStatus::Completed;
                        step.result = result.clone();
                        step.ended_at = Some(event.timestamp);
                    }
                    self.record_step_result(&name, result, event.timestamp);
                }
            }
            EventType::VariablesSet => {
                // Progress reports ride this repeatable event type but are
                // informational only; they never touch state.
                if event.payload.get("kind").and_then(Value::as_str) == Some("progress") {
                    return;
                }
                let kind: VariableKind = event
                    .payload
                    .get("kind")
                    .and_then(|k| serde_json::from_value(k.clone()).ok())
                    .unwrap_or(VariableKind::UserDefined);
                let Some(Value::Object(values)) = event.payload.get("values") else {
                    return;
                };
                match event.payload.get("scope").and_then(Value::as_str) {
                    // Scoped bindings become the target step's locals.
                    Some(scope) => {
                        let scope = scope.to_string();
                        let step = self.step_entry(&scope);
                        for (key, value) in values {
                            step.local_args.insert(key.clone(), value.clone());
                        }
                    }
                    None => {
                        for (key, value) in values {
                            self.variables.insert(
                                key.clone(),
                                Variable {
                                    value: value.clone(),
                                    kind,
                                    source_node: event.node_id.clone(),
                                    created_at: event.timestamp,
                                    accessed_at: None,
                                    access_count: 0,
                                },
                            );
                        }
                    }
                }
            }
            EventType::SaveEmitted => {
                if let Some((name, _)) = split_node(event) {
                    self.step_entry(name).save_status = Some(event.status);
                }
            }
        }
    }

    fn step_entry(&mut self, name: &str) -> &mut StepSnapshot {
        self.steps
            .entry(name.to_string())
            .or_insert_with(StepSnapshot::new)
    }

    fn record_step_result(
        &mut self,
        name: &str,
        result: Option<Value>,
        timestamp: DateTime<Utc>,
    ) {
        if let Some(result) = result {
            self.variables.insert(
                name.to_string(),
                Variable {
                    value: result,
                    kind: VariableKind::StepResult,
                    source_node: Some(name.to_string()),
                    created_at: timestamp,
                    accessed_at: None,
                    access_count: 0,
                },
            );
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepSnapshot> {
        self.steps.get(name)
    }

    pub fn step_status(&self, name: &str) -> StepStatus {
        self.steps
            .get(name)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn step_result(&self, name: &str) -> Option<&Value> {
        self.steps.get(name).and_then(|s| s.result.as_ref())
    }

    /// Iterator steps still waiting on outstanding indices.
    pub fn pending_fanins(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, step)| {
                step.iterator
                    .as_ref()
                    .map(|it| !it.completed)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Build the rendering context for a step: locals over variables over
    /// step results over workload.
    pub fn build_layers(&self, step_name: &str) -> ContextLayers {
        let locals = self
            .steps
            .get(step_name)
            .map(|s| s.local_args.clone())
            .unwrap_or_default();

        let variables: JsonMap = self
            .variables
            .iter()
            .map(|(name, var)| (name.clone(), var.value.clone()))
            .collect();

        let results: JsonMap = self
            .steps
            .iter()
            .filter_map(|(name, step)| {
                step.result.as_ref().map(|r| (name.clone(), r.clone()))
            })
            .collect();

        let mut workload_layer = JsonMap::new();
        workload_layer.insert(
            "workload".to_string(),
            Value::Object(self.workload.clone()),
        );
        for (key, value) in &self.workload {
            workload_layer.insert(key.clone(), value.clone());
        }

        ContextLayers::new()
            .with_execution_id(self.execution_id)
            .push(LayerKind::Locals, locals)
            .push(LayerKind::Variables, variables)
            .push(LayerKind::Results, results)
            .push(LayerKind::Workload, workload_layer)
    }

    /// Record that the variables store was read into a rendering context.
    /// Access bookkeeping is in-memory only and never evented.
    pub fn mark_variables_accessed(&mut self, names: &[&str]) {
        let now = Utc::now();
        for name in names {
            if let Some(var) = self.variables.get_mut(*name) {
                var.access_count += 1;
                var.accessed_at = Some(now);
            }
        }
    }
}

/// Split a node id into the base step name and whether it addresses the
/// step's save block.
fn split_node(event: &Event) -> Option<(&str, bool)> {
    let node = event.node_id.as_deref()?;
    match node.strip_suffix("::save") {
        Some(base) => Some((base, true)),
        None => Some((node, false)),
    }
}
