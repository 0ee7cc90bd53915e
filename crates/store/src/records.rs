//! Row shapes and request/outcome types shared by store implementations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use playmill_core::action::{fingerprint, ActionSpec, EntryKind};
use playmill_core::ExecutionStatus;

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Ready,
    Leased,
    Completed,
    Failed,
    Dead,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// One execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: i64,
    pub root_execution_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_iterator_index: Option<i32>,
    pub path: String,
    pub version: i32,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub dispatched_event_id: i64,
}

/// Link to the parent execution for sub-playbook children.
#[derive(Debug, Clone)]
pub struct ParentLink {
    pub execution_id: i64,
    pub root_execution_id: i64,
    pub step: String,
    pub iterator_index: Option<i32>,
}

/// Request to create an execution.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub path: String,
    pub version: i32,
    pub parent: Option<ParentLink>,
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub path: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub parent_execution_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Outcome of one event append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub event_id: i64,
    /// The logical event already existed; the prior id was returned and
    /// nothing was written.
    pub deduplicated: bool,
}

/// Lease request from a worker.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub worker_id: String,
    pub pool: String,
    /// Capability filter. Entries pinned to a runtime only go to workers
    /// declaring that runtime; unpinned entries go anywhere.
    pub runtime: Option<String>,
    pub max_entries: usize,
    pub lease_duration: Duration,
}

/// A queue entry held under lease by a worker.
#[derive(Debug, Clone)]
pub struct LeasedEntry {
    pub queue_id: i64,
    pub execution_id: i64,
    pub node_id: String,
    pub iterator_index: Option<i32>,
    pub entry_kind: EntryKind,
    pub spec: ActionSpec,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub lease_expires_at: DateTime<Utc>,
}

impl LeasedEntry {
    /// Stable fingerprint for the current attempt, used to key terminal
    /// reports.
    pub fn fingerprint(&self) -> String {
        fingerprint(
            self.execution_id,
            &self.node_id,
            self.iterator_index,
            self.attempt_count,
        )
    }
}

/// Outcome of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Lease extended.
    Ok { lease_expires_at: DateTime<Utc> },
    /// The caller no longer owns the entry; stop working on it.
    Lost,
}

/// Outcome of a nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Returned to ready; visible again at the given time.
    Requeued { available_at: DateTime<Utc> },
    /// Attempts exhausted; the entry is dead and the terminal failure has
    /// been appended.
    Dead,
}

/// Aggregate queue counters for the control plane.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: u64,
    pub leased: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

/// One catalog row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub path: String,
    pub version: i32,
    pub content: String,
    pub parsed: Value,
    pub created_at: DateTime<Utc>,
}

/// Catalog listing entry (no content).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub path: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

/// Decrypted credential, handed to workers only.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub name: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Credential listing entry; never carries secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub name: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// Worker registration.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub pool: String,
    pub runtime: Option<String>,
    pub capacity: u32,
}

/// Worker registry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub pool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    pub capacity: u32,
    pub active_slots: u32,
    pub accepting: bool,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}
