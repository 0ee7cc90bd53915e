//! The broker daemon: drives the pure scheduling state machine against
//! the store.
//!
//! Loop: claim executions with undispatched events, fold their streams,
//! run [`Broker::decide`] per event, apply the effects (event appends and
//! queue entries in one transaction, child executions through the
//! composer), advance the dispatch cursor. Multiple daemon instances may
//! run concurrently: every derived transition deduplicates, so a race
//! costs wasted work, never a double effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use playmill_core::broker::{Broker, Effect};
use playmill_core::event::{Event, EventType, NewEvent};
use playmill_core::{EventStatus, Playbook, Snapshot};
use playmill_store::{EngineStore, ExecutionRecord};

use crate::composer::Composer;
use crate::config::BrokerConfig;
use crate::error::AppResult;
use crate::services::CatalogService;

pub struct BrokerDaemon {
    store: Arc<dyn EngineStore>,
    broker: Broker,
    catalog: CatalogService,
    composer: Composer,
    config: BrokerConfig,
    playbooks: Mutex<HashMap<(String, i32), Arc<Playbook>>>,
}

impl BrokerDaemon {
    pub fn new(
        store: Arc<dyn EngineStore>,
        catalog: CatalogService,
        composer: Composer,
        config: BrokerConfig,
    ) -> Self {
        Self {
            store,
            broker: Broker::new(),
            catalog,
            composer,
            config,
            playbooks: Mutex::new(HashMap::new()),
        }
    }

    /// Poll until shutdown, backing off while idle.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("broker daemon started");
        let mut interval = self.config.min_interval;

        while !*shutdown_rx.borrow() {
            let progressed = match self.tick().await {
                Ok(progressed) => progressed,
                Err(e) => {
                    error!("broker tick failed: {e}");
                    0
                }
            };

            interval = if progressed > 0 {
                self.config.min_interval
            } else {
                Duration::from_secs_f64(
                    (interval.as_secs_f64() * self.config.backoff_multiplier)
                        .min(self.config.max_interval.as_secs_f64()),
                )
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        info!("broker daemon stopped");
    }

    /// One scheduling pass over every dirty execution. Returns how many
    /// events were dispatched.
    pub async fn tick(&self) -> AppResult<usize> {
        let dirty = self.store.list_dirty_executions(self.config.batch).await?;
        let mut dispatched = 0;
        for record in dirty {
            match self.process_execution(record).await {
                Ok(count) => dispatched += count,
                Err(e) => warn!("execution processing failed: {e}"),
            }
        }
        Ok(dispatched)
    }

    /// Dispatch every undispatched event of one execution, including the
    /// events our own effects append, until the stream is quiet.
    #[instrument(skip(self, record), fields(execution_id = record.execution_id))]
    async fn process_execution(&self, mut record: ExecutionRecord) -> AppResult<usize> {
        let mut dispatched = 0;
        loop {
            let events = self
                .store
                .load_events(record.execution_id, None, None)
                .await?;
            let snapshot = Snapshot::fold(record.execution_id, &events);
            let pending: Vec<Event> = events
                .into_iter()
                .filter(|event| event.event_id > record.dispatched_event_id)
                .collect();
            if pending.is_empty() {
                return Ok(dispatched);
            }

            let playbook = self.playbook_for(&record.path, record.version).await?;

            for event in pending {
                self.dispatch_event(&playbook, &snapshot, &event, &record)
                    .await?;
                record.dispatched_event_id = event.event_id;
                self.store
                    .advance_cursor(record.execution_id, event.event_id)
                    .await?;
                dispatched += 1;
            }
        }
    }

    async fn dispatch_event(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        event: &Event,
        record: &ExecutionRecord,
    ) -> AppResult<()> {
        debug!(
            event_id = event.event_id,
            event_type = %event.event_type,
            "dispatching event"
        );

        // Keep the execution row in step with the stream, and mirror child
        // terminations into the parent.
        match event.event_type {
            // The folded status already accounts for anything appended
            // after the start (an immediate cancellation, for instance).
            EventType::ExecutionStart => {
                self.store
                    .set_execution_status(record.execution_id, snapshot.status)
                    .await?;
            }
            ty if ty.is_execution_terminal() => {
                self.store
                    .set_execution_status(record.execution_id, snapshot.status)
                    .await?;
                if record.parent_execution_id.is_some() {
                    let return_step = self.parent_return_step(record).await;
                    self.composer
                        .mirror_to_parent(record, snapshot, return_step.as_deref())
                        .await?;
                }
            }
            _ => {}
        }

        let effects = match self.broker.decide(playbook, snapshot, event) {
            Ok(effects) => effects,
            // A scheduling failure (for example a template error while
            // routing) is fatal to the execution, not to the daemon.
            Err(e) => {
                warn!(
                    execution_id = record.execution_id,
                    "scheduling failed: {e}"
                );
                vec![
                    Effect::CancelReady { node_id: None },
                    Effect::Append(
                        NewEvent::new(
                            record.execution_id,
                            EventType::ExecutionFailed,
                            EventStatus::Failed,
                        )
                        .with_parent(event.event_id)
                        .with_error(e.to_object()),
                    ),
                ]
            }
        };

        self.apply_effects(record, effects).await
    }

    async fn apply_effects(
        &self,
        record: &ExecutionRecord,
        effects: Vec<Effect>,
    ) -> AppResult<()> {
        let mut appends = Vec::new();
        let mut entries = Vec::new();

        for effect in effects {
            match effect {
                Effect::Append(event) => appends.push(event),
                Effect::Enqueue(entry) => entries.push(entry),
                Effect::CancelReady { node_id } => {
                    self.store
                        .cancel_ready_entries(record.execution_id, node_id.as_deref())
                        .await?;
                }
                Effect::SpawnChild(child) => {
                    let invoked = self.composer.spawn_child(record, &child).await?;
                    appends.push(invoked);
                }
            }
        }

        if !appends.is_empty() || !entries.is_empty() {
            self.store.append_with_queue(appends, entries).await?;
        }
        Ok(())
    }

    /// The `return_step` declared on the parent's sub-playbook step, if
    /// any. Failures here degrade to an unscoped aggregate rather than
    /// blocking the mirror.
    async fn parent_return_step(&self, child: &ExecutionRecord) -> Option<String> {
        let parent_id = child.parent_execution_id?;
        let step = child.parent_step.as_deref()?;
        let parent = self.store.get_execution(parent_id).await.ok()?;
        let playbook = self
            .playbook_for(&parent.path, parent.version)
            .await
            .ok()?;
        playbook.step(step)?.return_step.clone()
    }

    /// Parsed playbooks are cached per (path, version); versions are
    /// immutable so the cache never needs invalidation.
    async fn playbook_for(&self, path: &str, version: i32) -> AppResult<Arc<Playbook>> {
        let key = (path.to_string(), version);
        {
            let cache = self.playbooks.lock().await;
            if let Some(playbook) = cache.get(&key) {
                return Ok(playbook.clone());
            }
        }

        let playbook = Arc::new(self.catalog.load_playbook(path, Some(version)).await?);
        self.playbooks.lock().await.insert(key, playbook.clone());
        Ok(playbook)
    }
}

/// Periodically return expired leases to ready.
pub async fn reaper_loop(
    store: Arc<dyn EngineStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "lease reaper started");
    while !*shutdown_rx.borrow() {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => break,
        }
        match store.reap_expired().await {
            Ok(0) => {}
            Ok(reaped) => warn!(reaped, "returned expired leases to ready"),
            Err(e) => error!("lease reap failed: {e}"),
        }
    }
}
