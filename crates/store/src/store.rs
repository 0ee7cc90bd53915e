//! The `EngineStore` trait.
//!
//! This is the only seam through which the engine touches shared mutable
//! state. Two implementations exist: [`crate::PgEngineStore`] for
//! production and [`crate::MemoryEngineStore`] for tests, with identical
//! semantics.
//!
//! Transactionality contract: an event append either succeeds atomically
//! together with its queue mutation or not at all; readers never observe
//! partial writes. Per-execution event ids are strictly increasing and
//! contiguous.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use playmill_core::error::{ErrorKind, ErrorObject};
use playmill_core::event::{Event, EventStatus, EventType, NewEvent};
use playmill_core::action::{EntryKind, QueueSpec};
use playmill_core::ExecutionStatus;

use crate::error::StoreError;
use crate::records::*;

#[async_trait]
pub trait EngineStore: Send + Sync + 'static {
    // =========================================================================
    // Executions
    // =========================================================================

    /// Create an execution bound to a concrete playbook version. Ids are
    /// 64-bit and monotonically assigned.
    async fn create_execution(&self, req: NewExecution) -> Result<ExecutionRecord, StoreError>;

    async fn get_execution(&self, execution_id: i64) -> Result<ExecutionRecord, StoreError>;

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn set_execution_status(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
    ) -> Result<(), StoreError>;

    /// Executions with events beyond the broker dispatch cursor. This
    /// includes terminated executions whose trailing events (cancellation,
    /// late worker reports, save outcomes) still need dispatching —
    /// mirroring into a parent depends on it. Multiple brokers may observe
    /// the same execution; every transition they derive is idempotent, so
    /// racing is safe, just wasted work.
    async fn list_dirty_executions(
        &self,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Advance the dispatch cursor. Never moves backward.
    async fn advance_cursor(
        &self,
        execution_id: i64,
        through_event_id: i64,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Event log
    // =========================================================================

    /// Append events. Duplicate logical events (same execution, node,
    /// iterator index, type and attempt, for non-repeatable types) return
    /// the prior event id without re-writing.
    async fn append_events(
        &self,
        events: Vec<NewEvent>,
    ) -> Result<Vec<AppendOutcome>, StoreError>;

    /// Append events and create queue entries in one transaction.
    /// Duplicate entries (same fingerprint) are skipped.
    async fn append_with_queue(
        &self,
        events: Vec<NewEvent>,
        entries: Vec<QueueSpec>,
    ) -> Result<Vec<AppendOutcome>, StoreError>;

    /// Events for one execution in `event_id` order, optionally starting
    /// after `since_event_id`.
    async fn load_events(
        &self,
        execution_id: i64,
        since_event_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Most recent event of the given type, if any.
    async fn latest_event(
        &self,
        execution_id: i64,
        event_type: EventType,
    ) -> Result<Option<Event>, StoreError>;

    // =========================================================================
    // Queue
    // =========================================================================

    /// Atomically claim up to `max_entries` ready entries matching the
    /// worker's pool and runtime. Safe under concurrent lessors: each
    /// entry goes to exactly one.
    async fn lease_entries(&self, req: LeaseRequest) -> Result<Vec<LeasedEntry>, StoreError>;

    /// Extend a lease. Returns [`HeartbeatOutcome::Lost`] when the caller
    /// no longer owns the entry.
    async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
    ) -> Result<HeartbeatOutcome, StoreError>;

    /// Complete an entry and append its terminal action event in one
    /// transaction. Fails with [`StoreError::LeaseLost`] when the lease
    /// moved on.
    async fn ack(
        &self,
        queue_id: i64,
        worker_id: &str,
        result_event: NewEvent,
    ) -> Result<(), StoreError>;

    /// Terminally fail an entry without retrying (template, auth and
    /// logical action errors). Appends the final `action_failed`; the
    /// broker derives the step outcome from it.
    async fn ack_failed(
        &self,
        queue_id: i64,
        worker_id: &str,
        error: ErrorObject,
    ) -> Result<(), StoreError>;

    /// Return an entry to ready with backoff, or dead-letter it once
    /// attempts are exhausted. The dead-letter path appends the terminal
    /// step failure in the same transaction.
    async fn nack(
        &self,
        queue_id: i64,
        worker_id: &str,
        error: ErrorObject,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError>;

    /// Return expired leases to ready (nack with `lease_expired`),
    /// capped by the same attempt budget. Returns how many entries were
    /// reaped.
    async fn reap_expired(&self) -> Result<u64, StoreError>;

    /// Delete ready entries for an execution, optionally scoped to one
    /// node. Leased entries are left to finish cooperatively.
    async fn cancel_ready_entries(
        &self,
        execution_id: i64,
        node_id: Option<&str>,
    ) -> Result<u64, StoreError>;

    async fn queue_stats(&self) -> Result<QueueStats, StoreError>;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Store a playbook revision. Versions are monotonic per path and
    /// prior versions stay accessible forever.
    async fn register_playbook(
        &self,
        path: &str,
        content: &str,
        parsed: Value,
    ) -> Result<i32, StoreError>;

    /// Fetch a playbook; `None` resolves the highest version.
    async fn get_playbook(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> Result<CatalogRecord, StoreError>;

    async fn list_playbooks(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<CatalogSummary>, StoreError>;

    // =========================================================================
    // Credentials
    // =========================================================================

    async fn put_credential(
        &self,
        name: &str,
        kind: &str,
        payload: Value,
    ) -> Result<(), StoreError>;

    /// Decrypted credential for action invocation. Callers must keep the
    /// payload out of events and logs.
    async fn get_credential(&self, name: &str) -> Result<Option<CredentialRecord>, StoreError>;

    async fn list_credentials(&self) -> Result<Vec<CredentialSummary>, StoreError>;

    // =========================================================================
    // Worker registry
    // =========================================================================

    async fn register_worker(&self, registration: WorkerRegistration) -> Result<(), StoreError>;

    async fn worker_heartbeat(
        &self,
        worker_id: &str,
        active_slots: u32,
        accepting: bool,
    ) -> Result<(), StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;
}

// =============================================================================
// Shared event composition for the queue's failure paths. Both store
// implementations must produce identical streams.
// =============================================================================

/// Informational `action_failed` appended when an entry is requeued for
/// retry.
pub(crate) fn retry_failure_event(
    execution_id: i64,
    node_id: &str,
    iterator_index: Option<i32>,
    attempt: i32,
    error: &ErrorObject,
) -> NewEvent {
    let mut event = NewEvent::new(execution_id, EventType::ActionFailed, EventStatus::Failed)
        .with_node(node_id)
        .with_attempt(attempt)
        .with_payload(serde_json::json!({ "will_retry": true, "dead_letter": false }))
        .with_error(error.clone().with_attempt(attempt));
    if let Some(index) = iterator_index {
        event = event.with_iterator_index(index);
    }
    event
}

/// Terminal events appended when an entry exhausts its attempts: the final
/// `action_failed` plus the step-level failure — or, for save entries, a
/// failed `save_emitted`, since save failures never fail the producing
/// step.
pub(crate) fn dead_letter_events(
    execution_id: i64,
    node_id: &str,
    iterator_index: Option<i32>,
    entry_kind: EntryKind,
    attempt: i32,
    error: &ErrorObject,
) -> Vec<NewEvent> {
    let mut action_failed =
        NewEvent::new(execution_id, EventType::ActionFailed, EventStatus::Failed)
            .with_node(node_id)
            .with_attempt(attempt)
            .with_payload(serde_json::json!({ "will_retry": false, "dead_letter": true }))
            .with_error(error.clone().with_attempt(attempt));
    if let Some(index) = iterator_index {
        action_failed = action_failed.with_iterator_index(index);
    }

    let terminal = match entry_kind {
        EntryKind::Save => NewEvent::new(execution_id, EventType::SaveEmitted, EventStatus::Failed)
            .with_node(node_id)
            .with_error(
                ErrorObject::new(
                    ErrorKind::DeadLetter,
                    format!("save failed after {attempt} attempts: {}", error.message),
                )
                .with_attempt(attempt),
            ),
        EntryKind::Step => {
            let mut failed =
                NewEvent::new(execution_id, EventType::StepFailed, EventStatus::Failed)
                    .with_node(node_id)
                    .with_attempt(attempt)
                    .with_error(
                        ErrorObject::new(
                            ErrorKind::DeadLetter,
                            format!("attempts exhausted after {attempt}: {}", error.message),
                        )
                        .with_attempt(attempt),
                    );
            if let Some(index) = iterator_index {
                failed = failed.with_iterator_index(index);
            }
            failed
        }
    };

    vec![action_failed, terminal]
}

/// Final `action_failed` for a non-retryable failure reported by a worker.
/// The broker turns it into the step outcome.
pub(crate) fn terminal_failure_event(
    execution_id: i64,
    node_id: &str,
    iterator_index: Option<i32>,
    attempt: i32,
    error: &ErrorObject,
) -> NewEvent {
    let mut event = NewEvent::new(execution_id, EventType::ActionFailed, EventStatus::Failed)
        .with_node(node_id)
        .with_attempt(attempt)
        .with_payload(serde_json::json!({ "will_retry": false, "dead_letter": false }))
        .with_error(error.clone().with_attempt(attempt));
    if let Some(index) = iterator_index {
        event = event.with_iterator_index(index);
    }
    event
}
