//! The append-only event model.
//!
//! Events are the source of truth for every execution. They are immutable
//! once written; correction is modelled by appending a new event, never by
//! mutating. The full state of an execution is reconstructed by folding its
//! event stream in `event_id` order (see [`crate::state`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorObject;

/// Closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStart,
    ExecutionCompleted,
    ExecutionFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    ActionStarted,
    ActionCompleted,
    ActionFailed,
    IteratorExpanded,
    IteratorIterationCompleted,
    IteratorCompleted,
    SubplaybookInvoked,
    SubplaybookCompleted,
    VariablesSet,
    SaveEmitted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStart => "execution_start",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepSkipped => "step_skipped",
            Self::ActionStarted => "action_started",
            Self::ActionCompleted => "action_completed",
            Self::ActionFailed => "action_failed",
            Self::IteratorExpanded => "iterator_expanded",
            Self::IteratorIterationCompleted => "iterator_iteration_completed",
            Self::IteratorCompleted => "iterator_completed",
            Self::SubplaybookInvoked => "subplaybook_invoked",
            Self::SubplaybookCompleted => "subplaybook_completed",
            Self::VariablesSet => "variables_set",
            Self::SaveEmitted => "save_emitted",
        }
    }

    /// Event types that may legitimately repeat for the same
    /// `(execution, node, iterator_index, attempt)` tuple. These are
    /// excluded from duplicate-append detection.
    pub fn is_repeatable(&self) -> bool {
        matches!(self, Self::VariablesSet | Self::SaveEmitted)
    }

    /// Terminal outcome events for a step node.
    pub fn is_step_terminal(&self) -> bool {
        matches!(self, Self::StepCompleted | Self::StepFailed | Self::StepSkipped)
    }

    /// Terminal outcome events for the execution as a whole.
    pub fn is_execution_terminal(&self) -> bool {
        matches!(self, Self::ExecutionCompleted | Self::ExecutionFailed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {s}"))
    }
}

/// Coarse status attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown event status: {s}"))
    }
}

/// A persisted event. `event_id` is strictly increasing and contiguous
/// within one execution; there is no cross-execution ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub execution_id: i64,
    pub event_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterator_index: Option<i32>,
    pub status: EventStatus,
    #[serde(default)]
    pub attempt: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Event {
    /// Result carried in the payload, if any. Step and action completions
    /// store their output under the `result` key.
    pub fn result(&self) -> Option<&Value> {
        self.payload.get("result")
    }
}

/// An event that has not been assigned an id or timestamp yet. Ids are
/// allocated by the event log inside the append transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub execution_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterator_index: Option<i32>,
    pub status: EventStatus,
    #[serde(default)]
    pub attempt: i32,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl NewEvent {
    pub fn new(execution_id: i64, event_type: EventType, status: EventStatus) -> Self {
        Self {
            execution_id,
            parent_event_id: None,
            event_type,
            node_id: None,
            iterator_index: None,
            status,
            attempt: 0,
            payload: Value::Null,
            error: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_iterator_index(mut self, index: i32) -> Self {
        self.iterator_index = Some(index);
        self
    }

    pub fn with_parent(mut self, parent_event_id: i64) -> Self {
        self.parent_event_id = Some(parent_event_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.payload = serde_json::json!({ "result": result });
        self
    }

    pub fn with_error(mut self, error: ErrorObject) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Materialize into a persisted [`Event`] once the log has assigned an
    /// id. Used by store implementations.
    pub fn into_event(self, event_id: i64, timestamp: DateTime<Utc>) -> Event {
        Event {
            execution_id: self.execution_id,
            event_id,
            parent_event_id: self.parent_event_id,
            event_type: self.event_type,
            node_id: self.node_id,
            iterator_index: self.iterator_index,
            status: self.status,
            attempt: self.attempt,
            timestamp,
            payload: self.payload,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_round_trips() {
        for (ty, name) in [
            (EventType::ExecutionStart, "execution_start"),
            (EventType::IteratorIterationCompleted, "iterator_iteration_completed"),
            (EventType::SubplaybookCompleted, "subplaybook_completed"),
            (EventType::SaveEmitted, "save_emitted"),
        ] {
            assert_eq!(ty.as_str(), name);
            let parsed: EventType = name.parse().unwrap();
            assert_eq!(parsed, ty);
        }
        assert!("not_an_event".parse::<EventType>().is_err());
    }

    #[test]
    fn terminal_classification() {
        assert!(EventType::StepCompleted.is_step_terminal());
        assert!(EventType::StepSkipped.is_step_terminal());
        assert!(!EventType::StepStarted.is_step_terminal());
        assert!(EventType::ExecutionFailed.is_execution_terminal());
        assert!(!EventType::SubplaybookCompleted.is_execution_terminal());
    }

    #[test]
    fn repeatable_types_are_exempt_from_dedup() {
        assert!(EventType::VariablesSet.is_repeatable());
        assert!(EventType::SaveEmitted.is_repeatable());
        assert!(!EventType::StepCompleted.is_repeatable());
    }

    #[test]
    fn builder_produces_expected_shape() {
        let event = NewEvent::new(7, EventType::StepCompleted, EventStatus::Success)
            .with_node("s1")
            .with_result(json!({"value": 42}))
            .with_parent(3);

        assert_eq!(event.node_id.as_deref(), Some("s1"));
        assert_eq!(event.parent_event_id, Some(3));
        assert_eq!(event.payload["result"]["value"], json!(42));

        let persisted = event.into_event(9, Utc::now());
        assert_eq!(persisted.event_id, 9);
        assert_eq!(persisted.result(), Some(&json!({"value": 42})));
    }
}
