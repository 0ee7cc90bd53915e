//! The worker loop.
//!
//! Each worker leases entries from the queue, processes up to
//! `max_concurrency` of them in independent slot tasks, and reports every
//! outcome back through ack/ack_failed/nack. A per-slot heartbeat task
//! keeps the lease alive for the duration of the action; slots share no
//! mutable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use playmill_core::event::{EventStatus, EventType, NewEvent};
use playmill_core::playbook::JsonMap;
use playmill_core::render::ContextLayers;
use playmill_core::{EngineError, ErrorKind, ErrorObject, TemplateEngine};
use playmill_store::{
    EngineStore, HeartbeatOutcome, LeaseRequest, LeasedEntry, StoreError, WorkerRegistration,
};

use crate::actions::{ActionInvocation, ActionRegistry, ProgressSender, SecretHandle};
use crate::config::WorkerConfig;
use crate::poller::LeaseBackoff;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How one processed entry should be reported.
enum Disposition {
    Success(Value),
    /// Fatal to the step; no retry.
    Fatal(ErrorObject),
    /// Transient; nack with backoff.
    Retry(ErrorObject),
}

pub struct WorkerRuntime<S: EngineStore> {
    store: Arc<S>,
    registry: Arc<ActionRegistry>,
    engine: TemplateEngine,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl<S: EngineStore> WorkerRuntime<S> {
    pub fn new(store: Arc<S>, registry: ActionRegistry, config: WorkerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrency));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            registry: Arc::new(registry),
            engine: TemplateEngine::new(),
            config,
            slots,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Signal the run loop to stop leasing and drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Main loop: lease, dispatch to slots, adaptive backoff, graceful
    /// drain on shutdown.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, pool = %self.config.pool))]
    pub async fn run(self: Arc<Self>) -> Result<(), WorkerError> {
        self.store
            .register_worker(WorkerRegistration {
                worker_id: self.config.worker_id.clone(),
                pool: self.config.pool.clone(),
                runtime: self.config.runtime.clone(),
                capacity: self.config.max_concurrency as u32,
            })
            .await?;
        info!(slots = self.config.max_concurrency, "worker started");

        let registry_heartbeat = tokio::spawn(registry_heartbeat_loop(
            self.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = LeaseBackoff::new(self.config.poller.clone());

        while !*shutdown_rx.borrow() {
            let free = self.slots.available_permits();
            if free == 0 {
                // Saturated: back-pressure by not leasing at all.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poller.min_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            let leased = match self
                .store
                .lease_entries(LeaseRequest {
                    worker_id: self.config.worker_id.clone(),
                    pool: self.config.pool.clone(),
                    runtime: self.config.runtime.clone(),
                    max_entries: free,
                    lease_duration: self.config.lease_duration,
                })
                .await
            {
                Ok(leased) => leased,
                Err(e) => {
                    warn!("lease failed: {e}");
                    vec![]
                }
            };

            let found = !leased.is_empty();
            for entry in leased {
                let permit = self
                    .slots
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore never closes");
                let runtime = self.clone();
                tokio::spawn(async move {
                    runtime.process_entry(entry).await;
                    drop(permit);
                });
            }

            let wait = backoff.record(found);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        // Drain: wait for running slots to finish.
        info!("worker draining");
        let _ = tokio::time::timeout(self.config.lease_duration, async {
            while self.slots.available_permits() < self.config.max_concurrency {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        registry_heartbeat.abort();
        info!("worker stopped");
        Ok(())
    }

    /// Lease and process entries to completion inline. Used by tests and
    /// one-shot invocations; the production loop is [`run`](Self::run).
    pub async fn drain_once(&self) -> Result<usize, WorkerError> {
        let leased = self
            .store
            .lease_entries(LeaseRequest {
                worker_id: self.config.worker_id.clone(),
                pool: self.config.pool.clone(),
                runtime: self.config.runtime.clone(),
                max_entries: self.config.max_concurrency,
                lease_duration: self.config.lease_duration,
            })
            .await?;

        let count = leased.len();
        for entry in leased {
            self.process_entry(entry).await;
        }
        Ok(count)
    }

    /// Process one leased entry end to end: announce, render, resolve
    /// auth, invoke, report.
    #[instrument(skip(self, entry), fields(
        execution_id = entry.execution_id,
        node_id = %entry.node_id,
        attempt = entry.attempt_count,
    ))]
    async fn process_entry(&self, entry: LeasedEntry) {
        // Announce the attempt before touching the action so the stream
        // always shows the start even if this process dies mid-flight.
        let started = {
            let mut event = NewEvent::new(
                entry.execution_id,
                EventType::ActionStarted,
                EventStatus::Started,
            )
            .with_node(entry.node_id.clone())
            .with_attempt(entry.attempt_count)
            .with_payload(json!({ "worker_id": self.config.worker_id }));
            if let Some(index) = entry.iterator_index {
                event = event.with_iterator_index(index);
            }
            event
        };
        if let Err(e) = self.store.append_events(vec![started]).await {
            warn!("failed to announce action start: {e}");
        }

        // Per-slot heartbeat tied to this entry's lifetime.
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(entry_heartbeat_loop(
            self.store.clone(),
            entry.queue_id,
            self.config.worker_id.clone(),
            self.config.heartbeat_interval,
            lease_lost.clone(),
        ));

        let disposition = self.execute(&entry).await;
        heartbeat.abort();

        if lease_lost.load(Ordering::Relaxed) {
            // The reaper took the entry back; someone else will run it.
            warn!("lease lost mid-flight; discarding outcome");
            return;
        }

        let worker_id = self.config.worker_id.as_str();
        let report = match disposition {
            Disposition::Success(result) => {
                let mut event = NewEvent::new(
                    entry.execution_id,
                    EventType::ActionCompleted,
                    EventStatus::Success,
                )
                .with_node(entry.node_id.clone())
                .with_attempt(entry.attempt_count)
                .with_result(result);
                if let Some(index) = entry.iterator_index {
                    event = event.with_iterator_index(index);
                }
                self.store.ack(entry.queue_id, worker_id, event).await
            }
            Disposition::Fatal(error) => {
                debug!(kind = %error.kind, "terminal failure: {}", error.message);
                self.store
                    .ack_failed(
                        entry.queue_id,
                        worker_id,
                        error.with_attempt(entry.attempt_count),
                    )
                    .await
            }
            Disposition::Retry(error) => {
                let backoff = self.config.retry.delay_for_attempt(entry.attempt_count + 1);
                debug!(
                    kind = %error.kind,
                    backoff_ms = backoff.as_millis(),
                    "transient failure: {}",
                    error.message
                );
                self.store
                    .nack(
                        entry.queue_id,
                        worker_id,
                        error.with_attempt(entry.attempt_count),
                        backoff,
                    )
                    .await
                    .map(|_| ())
            }
        };

        match report {
            Ok(()) => {}
            // Redelivered elsewhere; our outcome is stale and ignored.
            Err(StoreError::LeaseLost(_)) => {
                warn!("entry was reclaimed before the outcome was reported")
            }
            Err(e) => error!("failed to report outcome: {e}"),
        }
    }

    /// Render and invoke; classification only, no reporting.
    async fn execute(&self, entry: &LeasedEntry) -> Disposition {
        let spec = &entry.spec;

        // Control-flow kinds are expanded by the broker and must never be
        // enqueued as worker entries.
        if spec.kind.is_control_flow() {
            return Disposition::Fatal(
                ErrorObject::action(format!("`{}` entries are broker-internal", spec.kind))
                    .with_retryable(false),
            );
        }

        let Some(action) = self.registry.get(spec.kind) else {
            return Disposition::Fatal(
                ErrorObject::action(format!(
                    "action kind `{}` is not wired into this worker",
                    spec.kind
                ))
                .with_retryable(false),
            );
        };

        // Render args over base config against the entry's context. The
        // broker captured the same context, so both sides agree on the
        // rendered values.
        let layers = ContextLayers::from_merged(&spec.context);
        let config = match self.render_config(spec, &layers) {
            Ok(config) => config,
            Err(e) => return Disposition::Fatal(e.to_object()),
        };

        // Secrets resolve by name at render time and stay in memory only.
        let secret = match &spec.auth {
            None => None,
            Some(name) => match self.store.get_credential(name).await {
                Ok(Some(record)) => Some(SecretHandle::new(record.kind, record.payload)),
                Ok(None) => {
                    return Disposition::Fatal(
                        ErrorObject::auth(format!("credential `{name}` not found"))
                            .with_retryable(false),
                    )
                }
                Err(e) => {
                    return Disposition::Retry(
                        ErrorObject::transport(format!("credential lookup failed: {e}"))
                            .with_source("credential_store"),
                    )
                }
            },
        };

        let deadline = self
            .config
            .action_deadline(Duration::from_secs(spec.timeout_secs));

        let (progress, progress_rx) = ProgressSender::channel();
        let progress_task = tokio::spawn(progress_append_loop(
            self.store.clone(),
            entry.execution_id,
            entry.node_id.clone(),
            progress_rx,
        ));

        let invocation = ActionInvocation {
            kind: spec.kind,
            config,
            context: spec.context.clone(),
            secret,
            deadline,
            execution_id: entry.execution_id,
            node_id: entry.node_id.clone(),
            attempt: entry.attempt_count,
            progress,
        };

        let outcome = tokio::time::timeout(deadline, action.invoke(invocation)).await;
        let _ = progress_task.await;

        match outcome {
            Ok(Ok(result)) => Disposition::Success(result),
            Ok(Err(error)) => {
                let retryable = error.retryable
                    || (action.safely_retryable() && error.kind == ErrorKind::ActionError);
                if retryable {
                    Disposition::Retry(error)
                } else {
                    Disposition::Fatal(error)
                }
            }
            Err(_) => Disposition::Retry(
                ErrorObject::timeout(format!(
                    "action exceeded its deadline of {}s",
                    deadline.as_secs()
                ))
                .with_source(spec.kind.as_str()),
            ),
        }
    }

    fn render_config(
        &self,
        spec: &playmill_core::ActionSpec,
        layers: &ContextLayers,
    ) -> Result<JsonMap, EngineError> {
        let mut rendered = self.engine.render_map(&spec.config, layers)?;
        for (key, value) in self.engine.render_map(&spec.args, layers)? {
            rendered.insert(key, value);
        }
        Ok(rendered)
    }
}

/// Keep the lease alive while the slot works. Flags the slot when the
/// lease is gone so a stale outcome is never reported.
async fn entry_heartbeat_loop<S: EngineStore>(
    store: Arc<S>,
    queue_id: i64,
    worker_id: String,
    interval: Duration,
    lease_lost: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        ticker.tick().await;
        match store.heartbeat(queue_id, &worker_id).await {
            Ok(HeartbeatOutcome::Ok { .. }) => {}
            Ok(HeartbeatOutcome::Lost) => {
                lease_lost.store(true, Ordering::Relaxed);
                return;
            }
            Err(e) => warn!(queue_id, "heartbeat failed: {e}"),
        }
    }
}

/// Drain progress reports into informational events. These ride the
/// repeatable `variables_set` type with a `progress` marker the state
/// fold ignores.
async fn progress_append_loop<S: EngineStore>(
    store: Arc<S>,
    execution_id: i64,
    node_id: String,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<(String, Value)>,
) {
    while let Some((kind, payload)) = rx.recv().await {
        let event = NewEvent::new(execution_id, EventType::VariablesSet, EventStatus::Started)
            .with_node(node_id.clone())
            .with_payload(json!({
                "kind": "progress",
                "values": {},
                "progress": { "kind": kind, "payload": payload },
            }));
        if let Err(e) = store.append_events(vec![event]).await {
            warn!("failed to append progress event: {e}");
        }
    }
}

/// Periodic liveness report to the worker registry.
async fn registry_heartbeat_loop<S: EngineStore>(
    runtime: Arc<WorkerRuntime<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = runtime.config.registry_heartbeat_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => return,
        }
        let active =
            (runtime.config.max_concurrency - runtime.slots.available_permits()) as u32;
        let accepting = !*shutdown_rx.borrow();
        if let Err(e) = runtime
            .store
            .worker_heartbeat(&runtime.config.worker_id, active, accepting)
            .await
        {
            warn!("registry heartbeat failed: {e}");
        }
    }
}
