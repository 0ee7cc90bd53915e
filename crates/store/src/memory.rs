//! In-memory implementation of [`EngineStore`] for tests.
//!
//! Mirrors the PostgreSQL implementation's semantics — append dedup,
//! contiguous per-execution event ids, exclusive leases, attempt
//! accounting — without a database, so the whole engine can run in a unit
//! test.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use playmill_core::action::QueueSpec;
use playmill_core::error::{ErrorKind, ErrorObject};
use playmill_core::event::{Event, EventType, NewEvent};
use playmill_core::ExecutionStatus;

use crate::error::StoreError;
use crate::records::*;
use crate::store::{
    dead_letter_events, retry_failure_event, terminal_failure_event, EngineStore,
};

struct QueueRow {
    queue_id: i64,
    spec: QueueSpec,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    lease_duration: Duration,
    attempt_count: i32,
    status: QueueStatus,
    fingerprint: String,
}

struct CatalogRow {
    record: CatalogRecord,
}

#[derive(Default)]
struct Inner {
    next_execution_id: i64,
    next_queue_id: i64,
    executions: BTreeMap<i64, ExecutionRecord>,
    events: BTreeMap<i64, Vec<Event>>,
    queue: BTreeMap<i64, QueueRow>,
    catalog: Vec<CatalogRow>,
    credentials: HashMap<String, CredentialRecord>,
    workers: HashMap<String, WorkerRecord>,
}

/// In-memory store. Cheap to clone via `Arc`; all state lives behind one
/// lock, which is fine at test scale.
#[derive(Default)]
pub struct MemoryEngineStore {
    inner: Mutex<Inner>,
}

impl MemoryEngineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently in `ready`.
    pub fn ready_count(&self) -> usize {
        self.inner
            .lock()
            .queue
            .values()
            .filter(|row| row.status == QueueStatus::Ready)
            .count()
    }

    /// Number of entries currently leased.
    pub fn leased_count(&self) -> usize {
        self.inner
            .lock()
            .queue
            .values()
            .filter(|row| row.status == QueueStatus::Leased)
            .count()
    }

    /// Force a lease to look expired (test helper for the reaper).
    pub fn expire_lease(&self, queue_id: i64) {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.queue.get_mut(&queue_id) {
            row.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    fn append_locked(inner: &mut Inner, events: Vec<NewEvent>) -> Vec<AppendOutcome> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let stream = inner.events.entry(event.execution_id).or_default();

            if !event.event_type.is_repeatable() {
                if let Some(prior) = stream.iter().find(|existing| {
                    existing.event_type == event.event_type
                        && existing.node_id == event.node_id
                        && existing.iterator_index == event.iterator_index
                        && existing.attempt == event.attempt
                }) {
                    outcomes.push(AppendOutcome {
                        event_id: prior.event_id,
                        deduplicated: true,
                    });
                    continue;
                }
            }

            let event_id = stream.last().map(|e| e.event_id).unwrap_or(0) + 1;
            stream.push(event.into_event(event_id, Utc::now()));
            outcomes.push(AppendOutcome {
                event_id,
                deduplicated: false,
            });
        }
        outcomes
    }

    fn enqueue_locked(inner: &mut Inner, entries: Vec<QueueSpec>) {
        let now = Utc::now();
        for spec in entries {
            let fingerprint = spec.fingerprint_at(0);
            if inner
                .queue
                .values()
                .any(|row| row.fingerprint == fingerprint)
            {
                continue;
            }
            inner.next_queue_id += 1;
            let queue_id = inner.next_queue_id;
            inner.queue.insert(
                queue_id,
                QueueRow {
                    queue_id,
                    spec,
                    enqueued_at: now,
                    available_at: now,
                    lease_owner: None,
                    lease_expires_at: None,
                    lease_duration: Duration::from_secs(0),
                    attempt_count: 0,
                    status: QueueStatus::Ready,
                    fingerprint,
                },
            );
        }
    }

    /// Shared requeue-or-dead path for nack and reap.
    fn fail_lease_locked(
        inner: &mut Inner,
        queue_id: i64,
        error: ErrorObject,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError> {
        let row = inner
            .queue
            .get_mut(&queue_id)
            .ok_or(StoreError::EntryNotFound(queue_id))?;

        let attempt = row.attempt_count;
        let spec = row.spec.clone();
        let dead = attempt >= spec.max_attempts;

        if dead {
            row.status = QueueStatus::Dead;
            row.lease_owner = None;
            row.lease_expires_at = None;
            let events = dead_letter_events(
                spec.execution_id,
                &spec.node_id,
                spec.iterator_index,
                spec.entry_kind,
                attempt,
                &error,
            );
            Self::append_locked(inner, events);
            Ok(NackOutcome::Dead)
        } else {
            let available_at =
                Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
            row.status = QueueStatus::Ready;
            row.lease_owner = None;
            row.lease_expires_at = None;
            row.available_at = available_at;
            row.fingerprint = spec.fingerprint_at(attempt);
            let event = retry_failure_event(
                spec.execution_id,
                &spec.node_id,
                spec.iterator_index,
                attempt,
                &error,
            );
            Self::append_locked(inner, vec![event]);
            Ok(NackOutcome::Requeued { available_at })
        }
    }

    fn take_leased(
        inner: &mut Inner,
        queue_id: i64,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        let row = inner
            .queue
            .get(&queue_id)
            .ok_or(StoreError::EntryNotFound(queue_id))?;
        if row.status != QueueStatus::Leased || row.lease_owner.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseLost(queue_id));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineStore for MemoryEngineStore {
    async fn create_execution(&self, req: NewExecution) -> Result<ExecutionRecord, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_execution_id += 1;
        let execution_id = inner.next_execution_id;

        let record = ExecutionRecord {
            execution_id,
            root_execution_id: req
                .parent
                .as_ref()
                .map(|p| p.root_execution_id)
                .unwrap_or(execution_id),
            parent_execution_id: req.parent.as_ref().map(|p| p.execution_id),
            parent_step: req.parent.as_ref().map(|p| p.step.clone()),
            parent_iterator_index: req.parent.as_ref().and_then(|p| p.iterator_index),
            path: req.path,
            version: req.version,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            ended_at: None,
            dispatched_event_id: 0,
        };
        inner.executions.insert(execution_id, record.clone());
        Ok(record)
    }

    async fn get_execution(&self, execution_id: i64) -> Result<ExecutionRecord, StoreError> {
        self.inner
            .lock()
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut records: Vec<_> = inner
            .executions
            .values()
            .filter(|record| {
                filter
                    .path
                    .as_deref()
                    .map(|path| record.path.contains(path))
                    .unwrap_or(true)
                    && filter
                        .status
                        .map(|status| record.status == status)
                        .unwrap_or(true)
                    && filter
                        .parent_execution_id
                        .map(|parent| record.parent_execution_id == Some(parent))
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| std::cmp::Reverse(record.execution_id));
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(50).clamp(1, 500) as usize;
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn set_execution_status(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let record = inner
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        record.status = status;
        if status.is_terminal() && record.ended_at.is_none() {
            record.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_dirty_executions(
        &self,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .executions
            .values()
            .filter(|record| {
                inner
                    .events
                    .get(&record.execution_id)
                    .and_then(|stream| stream.last())
                    .map(|last| last.event_id > record.dispatched_event_id)
                    .unwrap_or(false)
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn advance_cursor(
        &self,
        execution_id: i64,
        through_event_id: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let record = inner
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        record.dispatched_event_id = record.dispatched_event_id.max(through_event_id);
        Ok(())
    }

    async fn append_events(
        &self,
        events: Vec<NewEvent>,
    ) -> Result<Vec<AppendOutcome>, StoreError> {
        let mut inner = self.inner.lock();
        Ok(Self::append_locked(&mut inner, events))
    }

    async fn append_with_queue(
        &self,
        events: Vec<NewEvent>,
        entries: Vec<QueueSpec>,
    ) -> Result<Vec<AppendOutcome>, StoreError> {
        let mut inner = self.inner.lock();
        let outcomes = Self::append_locked(&mut inner, events);
        Self::enqueue_locked(&mut inner, entries);
        Ok(outcomes)
    }

    async fn load_events(
        &self,
        execution_id: i64,
        since_event_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();
        let since = since_event_id.unwrap_or(0);
        let limit = limit.unwrap_or(i64::MAX).max(0) as usize;
        Ok(inner
            .events
            .get(&execution_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|event| event.event_id > since)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_event(
        &self,
        execution_id: i64,
        event_type: EventType,
    ) -> Result<Option<Event>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.events.get(&execution_id).and_then(|stream| {
            stream
                .iter()
                .rev()
                .find(|event| event.event_type == event_type)
                .cloned()
        }))
    }

    async fn lease_entries(&self, req: LeaseRequest) -> Result<Vec<LeasedEntry>, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let mut candidates: Vec<i64> = inner
            .queue
            .values()
            .filter(|row| {
                row.status == QueueStatus::Ready
                    && row.available_at <= now
                    && row.spec.pool == req.pool
                    && row
                        .spec
                        .runtime
                        .as_deref()
                        .map(|needed| req.runtime.as_deref() == Some(needed))
                        .unwrap_or(true)
            })
            .map(|row| row.queue_id)
            .collect();
        candidates.sort_by_key(|queue_id| {
            let row = &inner.queue[queue_id];
            (
                std::cmp::Reverse(row.spec.priority),
                row.available_at,
                row.enqueued_at,
                row.queue_id,
            )
        });
        candidates.truncate(req.max_entries);

        let mut leased = Vec::with_capacity(candidates.len());
        for queue_id in candidates {
            let row = inner.queue.get_mut(&queue_id).expect("candidate exists");
            row.status = QueueStatus::Leased;
            row.lease_owner = Some(req.worker_id.clone());
            row.lease_duration = req.lease_duration;
            let expires =
                now + chrono::Duration::from_std(req.lease_duration).unwrap_or_default();
            row.lease_expires_at = Some(expires);
            row.attempt_count += 1;
            leased.push(LeasedEntry {
                queue_id,
                execution_id: row.spec.execution_id,
                node_id: row.spec.node_id.clone(),
                iterator_index: row.spec.iterator_index,
                entry_kind: row.spec.entry_kind,
                spec: row.spec.spec.clone(),
                attempt_count: row.attempt_count,
                max_attempts: row.spec.max_attempts,
                lease_expires_at: expires,
            });
        }
        Ok(leased)
    }

    async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let Some(row) = inner.queue.get_mut(&queue_id) else {
            return Ok(HeartbeatOutcome::Lost);
        };
        if row.status != QueueStatus::Leased || row.lease_owner.as_deref() != Some(worker_id) {
            return Ok(HeartbeatOutcome::Lost);
        }
        let expires =
            Utc::now() + chrono::Duration::from_std(row.lease_duration).unwrap_or_default();
        row.lease_expires_at = Some(expires);
        Ok(HeartbeatOutcome::Ok {
            lease_expires_at: expires,
        })
    }

    async fn ack(
        &self,
        queue_id: i64,
        worker_id: &str,
        result_event: NewEvent,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::take_leased(&mut inner, queue_id, worker_id)?;
        {
            let row = inner.queue.get_mut(&queue_id).expect("checked above");
            row.status = QueueStatus::Completed;
            row.lease_owner = None;
            row.lease_expires_at = None;
        }
        Self::append_locked(&mut inner, vec![result_event]);
        Ok(())
    }

    async fn ack_failed(
        &self,
        queue_id: i64,
        worker_id: &str,
        error: ErrorObject,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::take_leased(&mut inner, queue_id, worker_id)?;
        let (execution_id, node_id, index, attempt) = {
            let row = inner.queue.get_mut(&queue_id).expect("checked above");
            row.status = QueueStatus::Failed;
            row.lease_owner = None;
            row.lease_expires_at = None;
            (
                row.spec.execution_id,
                row.spec.node_id.clone(),
                row.spec.iterator_index,
                row.attempt_count,
            )
        };
        let event = terminal_failure_event(execution_id, &node_id, index, attempt, &error);
        Self::append_locked(&mut inner, vec![event]);
        Ok(())
    }

    async fn nack(
        &self,
        queue_id: i64,
        worker_id: &str,
        error: ErrorObject,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError> {
        let mut inner = self.inner.lock();
        Self::take_leased(&mut inner, queue_id, worker_id)?;
        Self::fail_lease_locked(&mut inner, queue_id, error, backoff)
    }

    async fn reap_expired(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let expired: Vec<i64> = inner
            .queue
            .values()
            .filter(|row| {
                row.status == QueueStatus::Leased
                    && row.lease_expires_at.map(|at| at < now).unwrap_or(false)
            })
            .map(|row| row.queue_id)
            .collect();

        let count = expired.len() as u64;
        for queue_id in expired {
            Self::fail_lease_locked(
                &mut inner,
                queue_id,
                ErrorObject::new(ErrorKind::LeaseExpired, "lease expired without heartbeat"),
                Duration::from_secs(0),
            )?;
        }
        Ok(count)
    }

    async fn cancel_ready_entries(
        &self,
        execution_id: i64,
        node_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let doomed: Vec<i64> = inner
            .queue
            .values()
            .filter(|row| {
                row.status == QueueStatus::Ready
                    && row.spec.execution_id == execution_id
                    && node_id
                        .map(|node| row.spec.node_id == node)
                        .unwrap_or(true)
            })
            .map(|row| row.queue_id)
            .collect();
        for queue_id in &doomed {
            inner.queue.remove(queue_id);
        }
        Ok(doomed.len() as u64)
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for row in inner.queue.values() {
            match row.status {
                QueueStatus::Ready => stats.ready += 1,
                QueueStatus::Leased => stats.leased += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn register_playbook(
        &self,
        path: &str,
        content: &str,
        parsed: Value,
    ) -> Result<i32, StoreError> {
        let mut inner = self.inner.lock();
        let version = inner
            .catalog
            .iter()
            .filter(|row| row.record.path == path)
            .map(|row| row.record.version)
            .max()
            .unwrap_or(0)
            + 1;
        inner.catalog.push(CatalogRow {
            record: CatalogRecord {
                path: path.to_string(),
                version,
                content: content.to_string(),
                parsed,
                created_at: Utc::now(),
            },
        });
        Ok(version)
    }

    async fn get_playbook(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> Result<CatalogRecord, StoreError> {
        let inner = self.inner.lock();
        inner
            .catalog
            .iter()
            .filter(|row| row.record.path == path)
            .filter(|row| version.map(|v| row.record.version == v).unwrap_or(true))
            .max_by_key(|row| row.record.version)
            .map(|row| row.record.clone())
            .ok_or_else(|| StoreError::PlaybookNotFound {
                path: path.to_string(),
                version,
            })
    }

    async fn list_playbooks(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<CatalogSummary>, StoreError> {
        let inner = self.inner.lock();
        let mut latest: HashMap<&str, &CatalogRecord> = HashMap::new();
        for row in &inner.catalog {
            if prefix
                .map(|p| row.record.path.starts_with(p))
                .unwrap_or(true)
            {
                let entry = latest.entry(row.record.path.as_str()).or_insert(&row.record);
                if row.record.version > entry.version {
                    *entry = &row.record;
                }
            }
        }
        let mut summaries: Vec<_> = latest
            .values()
            .map(|record| CatalogSummary {
                path: record.path.clone(),
                version: record.version,
                created_at: record.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(summaries)
    }

    async fn put_credential(
        &self,
        name: &str,
        kind: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.credentials.insert(
            name.to_string(),
            CredentialRecord {
                name: name.to_string(),
                kind: kind.to_string(),
                payload,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_credential(&self, name: &str) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self.inner.lock().credentials.get(name).cloned())
    }

    async fn list_credentials(&self) -> Result<Vec<CredentialSummary>, StoreError> {
        let inner = self.inner.lock();
        let mut summaries: Vec<_> = inner
            .credentials
            .values()
            .map(|record| CredentialSummary {
                name: record.name.clone(),
                kind: record.kind.clone(),
                created_at: record.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    async fn register_worker(&self, registration: WorkerRegistration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner.workers.insert(
            registration.worker_id.clone(),
            WorkerRecord {
                worker_id: registration.worker_id,
                pool: registration.pool,
                runtime: registration.runtime,
                capacity: registration.capacity,
                active_slots: 0,
                accepting: true,
                started_at: now,
                last_heartbeat_at: now,
            },
        );
        Ok(())
    }

    async fn worker_heartbeat(
        &self,
        worker_id: &str,
        active_slots: u32,
        accepting: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.workers.get_mut(worker_id) {
            record.active_slots = active_slots;
            record.accepting = accepting;
            record.last_heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut workers: Vec<_> = inner.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playmill_core::action::ActionSpec;
    use playmill_core::event::EventStatus;
    use playmill_core::ActionKind;
    use serde_json::json;

    fn entry(execution_id: i64, node: &str, max_attempts: i32) -> QueueSpec {
        QueueSpec::step(
            execution_id,
            node,
            ActionSpec::new(ActionKind::Noop, json!({})),
        )
        .with_max_attempts(max_attempts)
    }

    fn lease_request(worker: &str) -> LeaseRequest {
        LeaseRequest {
            worker_id: worker.to_string(),
            pool: "default".to_string(),
            runtime: None,
            max_entries: 10,
            lease_duration: Duration::from_secs(60),
        }
    }

    async fn lease_one(store: &MemoryEngineStore, worker: &str) -> LeasedEntry {
        let mut request = lease_request(worker);
        request.max_entries = 1;
        store.lease_entries(request).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn event_ids_are_contiguous_per_execution() {
        let store = MemoryEngineStore::new();
        for _ in 0..3 {
            store
                .append_events(vec![NewEvent::new(
                    1,
                    EventType::VariablesSet,
                    EventStatus::Success,
                )
                .with_payload(json!({"values": {}}))])
                .await
                .unwrap();
        }
        let events = store.load_events(1, None, None).await.unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn duplicate_append_returns_prior_id() {
        let store = MemoryEngineStore::new();
        let make = || {
            NewEvent::new(1, EventType::StepCompleted, EventStatus::Success).with_node("s1")
        };
        let first = store.append_events(vec![make()]).await.unwrap();
        let second = store.append_events(vec![make()]).await.unwrap();

        assert!(!first[0].deduplicated);
        assert!(second[0].deduplicated);
        assert_eq!(first[0].event_id, second[0].event_id);
        assert_eq!(store.load_events(1, None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let store = MemoryEngineStore::new();
        store
            .append_with_queue(vec![], vec![entry(1, "s1", 3)])
            .await
            .unwrap();

        let a = store.lease_entries(lease_request("worker-a")).await.unwrap();
        let b = store.lease_entries(lease_request("worker-b")).await.unwrap();

        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(a[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn runtime_pinned_entries_only_go_to_matching_workers() {
        let store = MemoryEngineStore::new();
        let pinned = entry(1, "gpu_step", 1).with_runtime(Some("gpu".into()));
        store
            .append_with_queue(vec![], vec![pinned, entry(1, "cpu_step", 1)])
            .await
            .unwrap();

        let plain = store.lease_entries(lease_request("w")).await.unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].node_id, "cpu_step");

        let mut gpu_request = lease_request("gpu-w");
        gpu_request.runtime = Some("gpu".into());
        let gpu = store.lease_entries(gpu_request).await.unwrap();
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].node_id, "gpu_step");
    }

    #[tokio::test]
    async fn heartbeat_reports_lost_after_reap() {
        let store = MemoryEngineStore::new();
        store
            .append_with_queue(vec![], vec![entry(1, "s1", 3)])
            .await
            .unwrap();
        let leased = lease_one(&store, "worker-a").await;

        store.expire_lease(leased.queue_id);
        assert_eq!(store.reap_expired().await.unwrap(), 1);

        let outcome = store.heartbeat(leased.queue_id, "worker-a").await.unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Lost);
        // Entry is ready again for someone else.
        assert_eq!(store.ready_count(), 1);
    }

    #[tokio::test]
    async fn reap_returns_each_expiry_once() {
        let store = MemoryEngineStore::new();
        store
            .append_with_queue(vec![], vec![entry(1, "s1", 3)])
            .await
            .unwrap();
        let leased = lease_one(&store, "w").await;
        store.expire_lease(leased.queue_id);

        assert_eq!(store.reap_expired().await.unwrap(), 1);
        assert_eq!(store.reap_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nack_requeues_with_backoff_then_dead_letters() {
        let store = MemoryEngineStore::new();
        store
            .append_with_queue(vec![], vec![entry(7, "s1", 2)])
            .await
            .unwrap();

        // Attempt 1 fails.
        let leased = lease_one(&store, "w").await;
        let outcome = store
            .nack(
                leased.queue_id,
                "w",
                ErrorObject::transport("reset"),
                Duration::from_secs(0),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, NackOutcome::Requeued { .. }));

        // Attempt 2 fails -> dead.
        let leased = lease_one(&store, "w").await;
        assert_eq!(leased.attempt_count, 2);
        let outcome = store
            .nack(
                leased.queue_id,
                "w",
                ErrorObject::transport("reset"),
                Duration::from_secs(0),
            )
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::Dead);

        let events = store.load_events(7, None, None).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::ActionFailed, // retry
                EventType::ActionFailed, // final
                EventType::StepFailed,   // dead letter
            ]
        );
        let dead = events.last().unwrap();
        assert_eq!(dead.error.as_ref().unwrap().kind, ErrorKind::DeadLetter);
    }

    #[tokio::test]
    async fn dead_save_entry_emits_save_emitted_not_step_failed() {
        let store = MemoryEngineStore::new();
        let save = QueueSpec::save(
            9,
            "s1",
            ActionSpec::new(ActionKind::Postgres, json!({})),
        );
        store.append_with_queue(vec![], vec![save]).await.unwrap();

        let leased = lease_one(&store, "w").await;
        let outcome = store
            .nack(
                leased.queue_id,
                "w",
                ErrorObject::transport("reset"),
                Duration::from_secs(0),
            )
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::Dead);

        let events = store.load_events(9, None, None).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::ActionFailed, EventType::SaveEmitted]);
    }

    #[tokio::test]
    async fn ack_after_lease_loss_is_rejected() {
        let store = MemoryEngineStore::new();
        store
            .append_with_queue(vec![], vec![entry(1, "s1", 3)])
            .await
            .unwrap();
        let leased = lease_one(&store, "w").await;
        store.expire_lease(leased.queue_id);
        store.reap_expired().await.unwrap();

        let result = store
            .ack(
                leased.queue_id,
                "w",
                NewEvent::new(1, EventType::ActionCompleted, EventStatus::Success)
                    .with_node("s1"),
            )
            .await;
        assert!(matches!(result, Err(StoreError::LeaseLost(_))));
    }

    #[tokio::test]
    async fn cancel_ready_removes_only_ready_entries() {
        let store = MemoryEngineStore::new();
        store
            .append_with_queue(
                vec![],
                vec![entry(1, "s1", 1), entry(1, "s2", 1), entry(2, "other", 1)],
            )
            .await
            .unwrap();
        let leased = lease_one(&store, "w").await;
        assert_eq!(leased.execution_id, 1);

        let removed = store.cancel_ready_entries(1, None).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.leased_count(), 1);
        // The other execution's entry is untouched.
        assert_eq!(store.ready_count(), 1);
    }

    #[tokio::test]
    async fn catalog_versions_are_monotonic_and_immutable() {
        let store = MemoryEngineStore::new();
        assert_eq!(
            store
                .register_playbook("a/b", "v1 text", json!({}))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .register_playbook("a/b", "v2 text", json!({}))
                .await
                .unwrap(),
            2
        );

        let latest = store.get_playbook("a/b", None).await.unwrap();
        assert_eq!(latest.version, 2);
        let pinned = store.get_playbook("a/b", Some(1)).await.unwrap();
        assert_eq!(pinned.content, "v1 text");
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_by_fingerprint() {
        let store = MemoryEngineStore::new();
        store
            .append_with_queue(vec![], vec![entry(1, "s1", 1)])
            .await
            .unwrap();
        store
            .append_with_queue(vec![], vec![entry(1, "s1", 1)])
            .await
            .unwrap();
        assert_eq!(store.ready_count(), 1);
    }

    #[tokio::test]
    async fn dirty_executions_track_the_cursor() {
        let store = MemoryEngineStore::new();
        let execution = store
            .create_execution(NewExecution {
                path: "a/b".into(),
                version: 1,
                parent: None,
            })
            .await
            .unwrap();
        assert!(store.list_dirty_executions(10).await.unwrap().is_empty());

        store
            .append_events(vec![NewEvent::new(
                execution.execution_id,
                EventType::ExecutionStart,
                EventStatus::Started,
            )])
            .await
            .unwrap();
        let dirty = store.list_dirty_executions(10).await.unwrap();
        assert_eq!(dirty.len(), 1);

        store
            .advance_cursor(execution.execution_id, 1)
            .await
            .unwrap();
        assert!(store.list_dirty_executions(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn credentials_round_trip_without_leaking_in_summaries() {
        let store = MemoryEngineStore::new();
        store
            .put_credential("db", "postgres", json!({"password": "hunter2"}))
            .await
            .unwrap();

        let record = store.get_credential("db").await.unwrap().unwrap();
        assert_eq!(record.payload["password"], json!("hunter2"));

        let summaries = store.list_credentials().await.unwrap();
        assert_eq!(summaries.len(), 1);
        let rendered = serde_json::to_string(&summaries).unwrap();
        assert!(!rendered.contains("hunter2"));
    }
}
