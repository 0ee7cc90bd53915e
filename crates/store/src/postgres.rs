//! PostgreSQL implementation of [`EngineStore`].
//!
//! Concurrency notes:
//! - Event appends serialize per execution via `pg_advisory_xact_lock`, so
//!   event ids stay contiguous under concurrent brokers and workers.
//! - Queue leasing uses a `FOR UPDATE SKIP LOCKED` CTE so each ready entry
//!   goes to exactly one lessor.
//! - Every append + queue mutation pair happens in one transaction; a
//!   crash leaves either both or neither.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, warn};

use playmill_core::action::QueueSpec;
use playmill_core::error::{ErrorKind, ErrorObject};
use playmill_core::event::{Event, EventType, NewEvent};
use playmill_core::ExecutionStatus;

use crate::error::StoreError;
use crate::records::*;
use crate::secrets::SecretCipher;
use crate::store::{
    dead_letter_events, retry_failure_event, terminal_failure_event, EngineStore,
};

/// Database URL from the environment. `DATABASE_URL` wins; otherwise the
/// URL is assembled from `POSTGRES_HOST`, `POSTGRES_PORT`,
/// `POSTGRES_USER`, `POSTGRES_PASSWORD` and `POSTGRES_DB`.
pub fn database_url_from_env() -> Result<String, StoreError> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.is_empty() {
            return Ok(url);
        }
    }

    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    let host = var("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string());
    let port = var("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string());
    let user = var("POSTGRES_USER").ok_or_else(|| {
        StoreError::Database("POSTGRES_USER (or DATABASE_URL) must be set".into())
    })?;
    let password = var("POSTGRES_PASSWORD").unwrap_or_default();
    let db = var("POSTGRES_DB").unwrap_or_else(|| user.clone());
    Ok(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgEngineStore {
    pool: PgPool,
    cipher: Option<SecretCipher>,
}

impl PgEngineStore {
    pub fn new(pool: PgPool, cipher: Option<SecretCipher>) -> Self {
        if cipher.is_none() {
            warn!("SECRETS_ENCRYPTION_KEY not configured; credential payloads are stored unencrypted");
        }
        Self { pool, cipher }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn lock_executions(
        tx: &mut Transaction<'_, Postgres>,
        events: &[NewEvent],
    ) -> Result<(), StoreError> {
        let mut ids: Vec<i64> = events.iter().map(|e| e.execution_id).collect();
        ids.sort_unstable();
        ids.dedup();
        // Ascending lock order avoids deadlock between concurrent appenders.
        for execution_id in ids {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(execution_id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn append_events_tx(
        tx: &mut Transaction<'_, Postgres>,
        events: Vec<NewEvent>,
    ) -> Result<Vec<AppendOutcome>, StoreError> {
        Self::lock_executions(tx, &events).await?;

        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            if !event.event_type.is_repeatable() {
                let prior: Option<(i64,)> = sqlx::query_as(
                    r#"
                    SELECT event_id FROM playmill_event
                    WHERE execution_id = $1
                      AND node_id IS NOT DISTINCT FROM $2
                      AND iterator_index IS NOT DISTINCT FROM $3
                      AND event_type = $4
                      AND attempt = $5
                    LIMIT 1
                    "#,
                )
                .bind(event.execution_id)
                .bind(&event.node_id)
                .bind(event.iterator_index)
                .bind(event.event_type.as_str())
                .bind(event.attempt)
                .fetch_optional(&mut **tx)
                .await?;

                if let Some((event_id,)) = prior {
                    debug!(
                        execution_id = event.execution_id,
                        event_type = %event.event_type,
                        event_id,
                        "duplicate append resolved to prior event"
                    );
                    outcomes.push(AppendOutcome {
                        event_id,
                        deduplicated: true,
                    });
                    continue;
                }
            }

            let error_json = event
                .error
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?;

            let row: (i64,) = sqlx::query_as(
                r#"
                INSERT INTO playmill_event (
                    execution_id, event_id, parent_event_id, event_type,
                    node_id, iterator_index, status, attempt, payload, error
                )
                SELECT $1, COALESCE(MAX(event_id), 0) + 1, $2, $3, $4, $5, $6, $7, $8, $9
                FROM playmill_event WHERE execution_id = $1
                RETURNING event_id
                "#,
            )
            .bind(event.execution_id)
            .bind(event.parent_event_id)
            .bind(event.event_type.as_str())
            .bind(&event.node_id)
            .bind(event.iterator_index)
            .bind(event.status.as_str())
            .bind(event.attempt)
            .bind(&event.payload)
            .bind(&error_json)
            .fetch_one(&mut **tx)
            .await?;

            outcomes.push(AppendOutcome {
                event_id: row.0,
                deduplicated: false,
            });
        }
        Ok(outcomes)
    }

    async fn enqueue_tx(
        tx: &mut Transaction<'_, Postgres>,
        entries: Vec<QueueSpec>,
    ) -> Result<(), StoreError> {
        for entry in entries {
            let fingerprint = entry.fingerprint_at(0);
            let spec_json = serde_json::to_value(&entry)?;
            sqlx::query(
                r#"
                INSERT INTO playmill_queue (
                    execution_id, node_id, iterator_index, entry_kind,
                    action_spec, pool, runtime, priority, max_attempts, fingerprint
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (fingerprint) DO NOTHING
                "#,
            )
            .bind(entry.execution_id)
            .bind(&entry.node_id)
            .bind(entry.iterator_index)
            .bind(match entry.entry_kind {
                playmill_core::EntryKind::Step => "step",
                playmill_core::EntryKind::Save => "save",
            })
            .bind(&spec_json)
            .bind(&entry.pool)
            .bind(&entry.runtime)
            .bind(entry.priority)
            .bind(entry.max_attempts)
            .bind(&fingerprint)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Load the queue row needed for a failure transition, verifying the
    /// caller still holds the lease.
    async fn locked_lease_row(
        tx: &mut Transaction<'_, Postgres>,
        queue_id: i64,
        worker_id: &str,
    ) -> Result<(QueueSpec, i32), StoreError> {
        let row = sqlx::query(
            r#"
            SELECT action_spec, attempt_count, status, lease_owner
            FROM playmill_queue
            WHERE queue_id = $1
            FOR UPDATE
            "#,
        )
        .bind(queue_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::EntryNotFound(queue_id))?;

        let status: String = row.get("status");
        let owner: Option<String> = row.get("lease_owner");
        if status != "leased" || owner.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseLost(queue_id));
        }

        let spec_json: Value = row.get("action_spec");
        let spec: QueueSpec = serde_json::from_value(spec_json)?;
        let attempt: i32 = row.get("attempt_count");
        Ok((spec, attempt))
    }

    /// Requeue-or-dead transition shared by nack and reap. The caller must
    /// have verified lease ownership (nack) or expiry (reap).
    async fn fail_lease_tx(
        tx: &mut Transaction<'_, Postgres>,
        queue_id: i64,
        spec: &QueueSpec,
        attempt: i32,
        error: &ErrorObject,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError> {
        let error_json = serde_json::to_value(error)?;

        if attempt >= spec.max_attempts {
            sqlx::query(
                r#"
                UPDATE playmill_queue
                SET status = 'dead',
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    last_error = $2
                WHERE queue_id = $1
                "#,
            )
            .bind(queue_id)
            .bind(&error_json)
            .execute(&mut **tx)
            .await?;

            let events = dead_letter_events(
                spec.execution_id,
                &spec.node_id,
                spec.iterator_index,
                spec.entry_kind,
                attempt,
                error,
            );
            Self::append_events_tx(tx, events).await?;
            debug!(queue_id, attempt, "entry dead-lettered");
            Ok(NackOutcome::Dead)
        } else {
            let available_at =
                Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
            sqlx::query(
                r#"
                UPDATE playmill_queue
                SET status = 'ready',
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    available_at = $2,
                    fingerprint = $3,
                    last_error = $4
                WHERE queue_id = $1
                "#,
            )
            .bind(queue_id)
            .bind(available_at)
            .bind(spec.fingerprint_at(attempt))
            .bind(&error_json)
            .execute(&mut **tx)
            .await?;

            let event = retry_failure_event(
                spec.execution_id,
                &spec.node_id,
                spec.iterator_index,
                attempt,
                error,
            );
            Self::append_events_tx(tx, vec![event]).await?;
            debug!(queue_id, attempt, "entry requeued for retry");
            Ok(NackOutcome::Requeued { available_at })
        }
    }
}

fn row_to_event(row: &PgRow) -> Result<Event, StoreError> {
    let event_type: String = row.get("event_type");
    let status: String = row.get("status");
    let error_json: Option<Value> = row.get("error");

    Ok(Event {
        execution_id: row.get("execution_id"),
        event_id: row.get("event_id"),
        parent_event_id: row.get("parent_event_id"),
        event_type: event_type
            .parse()
            .map_err(StoreError::Serialization)?,
        node_id: row.get("node_id"),
        iterator_index: row.get("iterator_index"),
        status: status.parse().map_err(StoreError::Serialization)?,
        attempt: row.get("attempt"),
        timestamp: row.get("created_at"),
        payload: row.get("payload"),
        error: error_json
            .map(serde_json::from_value)
            .transpose()?,
    })
}

fn row_to_execution(row: &PgRow) -> Result<ExecutionRecord, StoreError> {
    let status: String = row.get("status");
    Ok(ExecutionRecord {
        execution_id: row.get("execution_id"),
        root_execution_id: row.get("root_execution_id"),
        parent_execution_id: row.get("parent_execution_id"),
        parent_step: row.get("parent_step"),
        parent_iterator_index: row.get("parent_iterator_index"),
        path: row.get("path"),
        version: row.get("version"),
        status: status
            .parse()
            .map_err(StoreError::Serialization)?,
        created_at: row.get("created_at"),
        ended_at: row.get("ended_at"),
        dispatched_event_id: row.get("dispatched_event_id"),
    })
}

const EXECUTION_COLUMNS: &str = r#"
    execution_id, root_execution_id, parent_execution_id, parent_step,
    parent_iterator_index, path, version, status, created_at, ended_at,
    dispatched_event_id
"#;

const EVENT_COLUMNS: &str = r#"
    execution_id, event_id, parent_event_id, event_type, node_id,
    iterator_index, status, attempt, created_at, payload, error
"#;

#[async_trait]
impl EngineStore for PgEngineStore {
    #[instrument(skip(self, req), fields(path = %req.path))]
    async fn create_execution(&self, req: NewExecution) -> Result<ExecutionRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO playmill_execution (
                root_execution_id, parent_execution_id, parent_step,
                parent_iterator_index, path, version, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(req.parent.as_ref().map(|p| p.root_execution_id).unwrap_or(0))
        .bind(req.parent.as_ref().map(|p| p.execution_id))
        .bind(req.parent.as_ref().map(|p| p.step.as_str()))
        .bind(req.parent.as_ref().and_then(|p| p.iterator_index))
        .bind(&req.path)
        .bind(req.version)
        .fetch_one(&mut *tx)
        .await?;

        let mut record = row_to_execution(&row)?;

        // A root execution is its own root.
        if req.parent.is_none() {
            sqlx::query(
                "UPDATE playmill_execution SET root_execution_id = execution_id WHERE execution_id = $1",
            )
            .bind(record.execution_id)
            .execute(&mut *tx)
            .await?;
            record.root_execution_id = record.execution_id;
        }

        tx.commit().await?;
        debug!(execution_id = record.execution_id, "created execution");
        Ok(record)
    }

    async fn get_execution(&self, execution_id: i64) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM playmill_execution WHERE execution_id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        row_to_execution(&row)
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM playmill_execution
            WHERE ($1::text IS NULL OR path LIKE $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::bigint IS NULL OR parent_execution_id = $3)
            ORDER BY execution_id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.path.as_ref().map(|p| format!("%{p}%")))
        .bind(filter.status.map(|s| s.as_str().to_string()))
        .bind(filter.parent_execution_id)
        .bind(filter.limit.unwrap_or(50).clamp(1, 500))
        .bind(filter.offset.unwrap_or(0).max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn set_execution_status(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
    ) -> Result<(), StoreError> {
        let ended = status.is_terminal();
        sqlx::query(
            r#"
            UPDATE playmill_execution
            SET status = $2,
                ended_at = CASE WHEN $3 THEN COALESCE(ended_at, NOW()) ELSE ended_at END
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(ended)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dirty_executions(
        &self,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM playmill_execution e
            WHERE EXISTS (
                  SELECT 1 FROM playmill_event ev
                  WHERE ev.execution_id = e.execution_id
                    AND ev.event_id > e.dispatched_event_id
              )
            ORDER BY e.execution_id
            LIMIT $1
            "#
        ))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn advance_cursor(
        &self,
        execution_id: i64,
        through_event_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE playmill_execution
            SET dispatched_event_id = GREATEST(dispatched_event_id, $2)
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(through_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        events: Vec<NewEvent>,
    ) -> Result<Vec<AppendOutcome>, StoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let mut tx = self.pool.begin().await?;
        let outcomes = Self::append_events_tx(&mut tx, events).await?;
        tx.commit().await?;
        Ok(outcomes)
    }

    #[instrument(skip(self, events, entries))]
    async fn append_with_queue(
        &self,
        events: Vec<NewEvent>,
        entries: Vec<QueueSpec>,
    ) -> Result<Vec<AppendOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let outcomes = Self::append_events_tx(&mut tx, events).await?;
        Self::enqueue_tx(&mut tx, entries).await?;
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn load_events(
        &self,
        execution_id: i64,
        since_event_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM playmill_event
            WHERE execution_id = $1 AND event_id > $2
            ORDER BY event_id
            LIMIT $3
            "#
        ))
        .bind(execution_id)
        .bind(since_event_id.unwrap_or(0))
        .bind(limit.unwrap_or(100_000).max(1))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn latest_event(
        &self,
        execution_id: i64,
        event_type: EventType,
    ) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM playmill_event
            WHERE execution_id = $1 AND event_type = $2
            ORDER BY event_id DESC
            LIMIT 1
            "#
        ))
        .bind(execution_id)
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_event).transpose()
    }

    #[instrument(skip(self, req), fields(worker_id = %req.worker_id, pool = %req.pool))]
    async fn lease_entries(&self, req: LeaseRequest) -> Result<Vec<LeasedEntry>, StoreError> {
        let lease_ms = req.lease_duration.as_millis() as i64;
        let rows = sqlx::query(
            r#"
            WITH ready AS (
                SELECT queue_id
                FROM playmill_queue
                WHERE status = 'ready'
                  AND pool = $1
                  AND (runtime IS NULL OR runtime = $2)
                  AND available_at <= NOW()
                ORDER BY priority DESC, available_at, enqueued_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE playmill_queue q
            SET status = 'leased',
                lease_owner = $4,
                lease_expires_at = NOW() + make_interval(secs => $5::double precision / 1000.0),
                lease_duration_ms = $5,
                attempt_count = attempt_count + 1
            FROM ready
            WHERE q.queue_id = ready.queue_id
            RETURNING q.queue_id, q.execution_id, q.node_id, q.iterator_index,
                      q.entry_kind, q.action_spec, q.attempt_count, q.max_attempts,
                      q.lease_expires_at
            "#,
        )
        .bind(&req.pool)
        .bind(&req.runtime)
        .bind(req.max_entries.max(1) as i64)
        .bind(&req.worker_id)
        .bind(lease_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("lease failed: {e}");
            StoreError::from(e)
        })?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let spec_json: Value = row.get("action_spec");
            let spec: QueueSpec = serde_json::from_value(spec_json)?;
            let entry_kind: String = row.get("entry_kind");
            leased.push(LeasedEntry {
                queue_id: row.get("queue_id"),
                execution_id: row.get("execution_id"),
                node_id: row.get("node_id"),
                iterator_index: row.get("iterator_index"),
                entry_kind: if entry_kind == "save" {
                    playmill_core::EntryKind::Save
                } else {
                    playmill_core::EntryKind::Step
                },
                spec: spec.spec,
                attempt_count: row.get("attempt_count"),
                max_attempts: row.get("max_attempts"),
                lease_expires_at: row.get("lease_expires_at"),
            });
        }

        if !leased.is_empty() {
            debug!(count = leased.len(), "leased entries");
        }
        Ok(leased)
    }

    async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE playmill_queue
            SET lease_expires_at = NOW() + make_interval(secs => lease_duration_ms::double precision / 1000.0)
            WHERE queue_id = $1 AND lease_owner = $2 AND status = 'leased'
            RETURNING lease_expires_at
            "#,
        )
        .bind(queue_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => HeartbeatOutcome::Ok {
                lease_expires_at: row.get("lease_expires_at"),
            },
            None => HeartbeatOutcome::Lost,
        })
    }

    #[instrument(skip(self, result_event))]
    async fn ack(
        &self,
        queue_id: i64,
        worker_id: &str,
        result_event: NewEvent,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE playmill_queue
            SET status = 'completed', lease_owner = NULL, lease_expires_at = NULL
            WHERE queue_id = $1 AND lease_owner = $2 AND status = 'leased'
            "#,
        )
        .bind(queue_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(queue_id));
        }

        Self::append_events_tx(&mut tx, vec![result_event]).await?;
        tx.commit().await?;
        debug!(queue_id, "acked entry");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn ack_failed(
        &self,
        queue_id: i64,
        worker_id: &str,
        error: ErrorObject,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let (spec, attempt) = Self::locked_lease_row(&mut tx, queue_id, worker_id).await?;

        sqlx::query(
            r#"
            UPDATE playmill_queue
            SET status = 'failed', lease_owner = NULL, lease_expires_at = NULL, last_error = $2
            WHERE queue_id = $1
            "#,
        )
        .bind(queue_id)
        .bind(serde_json::to_value(&error)?)
        .execute(&mut *tx)
        .await?;

        let event = terminal_failure_event(
            spec.execution_id,
            &spec.node_id,
            spec.iterator_index,
            attempt,
            &error,
        );
        Self::append_events_tx(&mut tx, vec![event]).await?;
        tx.commit().await?;
        debug!(queue_id, "entry failed terminally");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn nack(
        &self,
        queue_id: i64,
        worker_id: &str,
        error: ErrorObject,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let (spec, attempt) = Self::locked_lease_row(&mut tx, queue_id, worker_id).await?;
        let outcome =
            Self::fail_lease_tx(&mut tx, queue_id, &spec, attempt, &error, backoff).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn reap_expired(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT queue_id, action_spec, attempt_count
            FROM playmill_queue
            WHERE status = 'leased' AND lease_expires_at < NOW()
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = 0u64;
        for row in rows {
            let queue_id: i64 = row.get("queue_id");
            let spec_json: Value = row.get("action_spec");
            let spec: QueueSpec = serde_json::from_value(spec_json)?;
            let attempt: i32 = row.get("attempt_count");
            Self::fail_lease_tx(
                &mut tx,
                queue_id,
                &spec,
                attempt,
                &ErrorObject::new(ErrorKind::LeaseExpired, "lease expired without heartbeat"),
                Duration::from_secs(0),
            )
            .await?;
            reaped += 1;
        }

        tx.commit().await?;
        if reaped > 0 {
            debug!(reaped, "reaped expired leases");
        }
        Ok(reaped)
    }

    async fn cancel_ready_entries(
        &self,
        execution_id: i64,
        node_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM playmill_queue
            WHERE execution_id = $1
              AND status = 'ready'
              AND ($2::text IS NULL OR node_id = $2)
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM playmill_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.as_str() {
                "ready" => stats.ready = count,
                "leased" => stats.leased = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "dead" => stats.dead = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self, content, parsed))]
    async fn register_playbook(
        &self,
        path: &str,
        content: &str,
        parsed: Value,
    ) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serialize version assignment per path.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(path)
            .execute(&mut *tx)
            .await?;

        let row: (i32,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM playmill_catalog WHERE path = $1",
        )
        .bind(path)
        .fetch_one(&mut *tx)
        .await?;
        let version = row.0;

        sqlx::query(
            "INSERT INTO playmill_catalog (path, version, content, parsed) VALUES ($1, $2, $3, $4)",
        )
        .bind(path)
        .bind(version)
        .bind(content)
        .bind(&parsed)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(path, version, "registered playbook");
        Ok(version)
    }

    async fn get_playbook(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> Result<CatalogRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT path, version, content, parsed, created_at
            FROM playmill_catalog
            WHERE path = $1 AND ($2::int IS NULL OR version = $2)
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(path)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::PlaybookNotFound {
            path: path.to_string(),
            version,
        })?;

        Ok(CatalogRecord {
            path: row.get("path"),
            version: row.get("version"),
            content: row.get("content"),
            parsed: row.get("parsed"),
            created_at: row.get("created_at"),
        })
    }

    async fn list_playbooks(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<CatalogSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (path) path, version, created_at
            FROM playmill_catalog
            WHERE ($1::text IS NULL OR path LIKE $1 || '%')
            ORDER BY path, version DESC
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CatalogSummary {
                path: row.get("path"),
                version: row.get("version"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    #[instrument(skip(self, payload))]
    async fn put_credential(
        &self,
        name: &str,
        kind: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(&payload)?;
        let (stored, encrypted) = match &self.cipher {
            Some(cipher) => (cipher.seal(serialized.as_bytes())?, true),
            None => (serialized, false),
        };

        sqlx::query(
            r#"
            INSERT INTO playmill_credential (name, kind, payload, encrypted)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                kind = EXCLUDED.kind,
                payload = EXCLUDED.payload,
                encrypted = EXCLUDED.encrypted,
                updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(kind)
        .bind(&stored)
        .bind(encrypted)
        .execute(&self.pool)
        .await?;
        debug!(name, kind, "stored credential");
        Ok(())
    }

    async fn get_credential(&self, name: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let Some(row) = sqlx::query(
            "SELECT name, kind, payload, encrypted, created_at FROM playmill_credential WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let stored: String = row.get("payload");
        let encrypted: bool = row.get("encrypted");
        let serialized = if encrypted {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                StoreError::Encryption(
                    "credential is encrypted but no SECRETS_ENCRYPTION_KEY is configured".into(),
                )
            })?;
            String::from_utf8(cipher.open(&stored)?)
                .map_err(|e| StoreError::Encryption(e.to_string()))?
        } else {
            stored
        };

        Ok(Some(CredentialRecord {
            name: row.get("name"),
            kind: row.get("kind"),
            payload: serde_json::from_str(&serialized)?,
            created_at: row.get("created_at"),
        }))
    }

    async fn list_credentials(&self) -> Result<Vec<CredentialSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, kind, created_at FROM playmill_credential ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CredentialSummary {
                name: row.get("name"),
                kind: row.get("kind"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn register_worker(&self, registration: WorkerRegistration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO playmill_worker (worker_id, pool, runtime, capacity)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (worker_id) DO UPDATE SET
                pool = EXCLUDED.pool,
                runtime = EXCLUDED.runtime,
                capacity = EXCLUDED.capacity,
                accepting = TRUE,
                last_heartbeat_at = NOW()
            "#,
        )
        .bind(&registration.worker_id)
        .bind(&registration.pool)
        .bind(&registration.runtime)
        .bind(registration.capacity as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn worker_heartbeat(
        &self,
        worker_id: &str,
        active_slots: u32,
        accepting: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE playmill_worker
            SET active_slots = $2, accepting = $3, last_heartbeat_at = NOW()
            WHERE worker_id = $1
            "#,
        )
        .bind(worker_id)
        .bind(active_slots as i32)
        .bind(accepting)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, pool, runtime, capacity, active_slots, accepting,
                   started_at, last_heartbeat_at
            FROM playmill_worker
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkerRecord {
                worker_id: row.get("worker_id"),
                pool: row.get("pool"),
                runtime: row.get("runtime"),
                capacity: row.get::<i32, _>("capacity") as u32,
                active_slots: row.get::<i32, _>("active_slots") as u32,
                accepting: row.get("accepting"),
                started_at: row.get("started_at"),
                last_heartbeat_at: row.get("last_heartbeat_at"),
            })
            .collect())
    }
}
