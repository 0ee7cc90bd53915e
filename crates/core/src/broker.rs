//! The scheduling state machine.
//!
//! [`Broker::decide`] is a pure function from `(playbook, snapshot,
//! incoming event)` to a list of [`Effect`]s. All I/O — appending events,
//! enqueueing work, creating child executions — happens in a thin driver
//! that applies the effects transactionally. This keeps the scheduler
//! unit-testable without a database.
//!
//! Every transition is idempotent under replay: appends deduplicate on the
//! event log's uniqueness rules and enqueues deduplicate on the entry
//! fingerprint, so concurrent brokers folding the same stream converge on
//! one outcome.

use serde_json::Value;

use crate::action::{base_step, ActionSpec, QueueSpec, DEFAULT_MAX_ATTEMPTS};
use crate::error::{EngineError, ErrorObject};
use crate::event::{Event, EventStatus, EventType, NewEvent};
use crate::playbook::{
    ActionKind, CaseArm, Edge, IterMode, JsonMap, Playbook, StepDef, END_STEP, START_STEP,
};
use crate::render::{ContextLayers, TemplateEngine};
use crate::state::{Snapshot, StepStatus};

/// A state transition requested by the broker. Effects produced by one
/// `decide` call are applied in order, in a single transaction where the
/// store allows it.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append an event to the execution's stream.
    Append(NewEvent),
    /// Create a queue entry (same transaction as the appends).
    Enqueue(QueueSpec),
    /// Start a child execution for a sub-playbook step.
    SpawnChild(ChildSpec),
    /// Delete ready queue entries, optionally scoped to one node.
    CancelReady { node_id: Option<String> },
}

/// Child execution request for a sub-playbook step.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpec {
    pub step: String,
    pub path: String,
    pub version: Option<i32>,
    pub payload: Value,
    pub parent_event_id: i64,
}

/// The pure half of the scheduler.
pub struct Broker {
    engine: TemplateEngine,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            engine: TemplateEngine::new(),
        }
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    /// Decide the next transitions after `event`. The snapshot must already
    /// include `event` in its fold.
    pub fn decide(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Vec<Effect>, EngineError> {
        // A terminal execution schedules nothing further; late terminal
        // reports from leased workers are recorded upstream and ignored
        // here (cooperative cancellation). Save outcomes are the one
        // exception: they are still written down, they just schedule
        // nothing.
        if snapshot.status.is_terminal() {
            let save_report = matches!(
                event.event_type,
                EventType::ActionCompleted | EventType::ActionFailed
            ) && event
                .node_id
                .as_deref()
                .map(|node| base_step(node).1)
                .unwrap_or(false);
            if !save_report {
                return Ok(vec![]);
            }
        }

        match event.event_type {
            EventType::ExecutionStart => {
                self.schedule_step(playbook, snapshot, START_STEP, event, JsonMap::new())
            }
            EventType::ActionCompleted => self.on_action_completed(snapshot, event),
            EventType::ActionFailed => self.on_action_failed(snapshot, event),
            EventType::StepCompleted
            | EventType::IteratorCompleted
            | EventType::SubplaybookCompleted => self.on_step_succeeded(playbook, snapshot, event),
            EventType::StepFailed => self.on_step_failed(playbook, snapshot, event),
            EventType::IteratorIterationCompleted => {
                self.on_iteration_completed(playbook, snapshot, event)
            }
            // Everything else is informational at this layer.
            _ => Ok(vec![]),
        }
    }

    // =========================================================================
    // Action outcomes -> step outcomes
    // =========================================================================

    fn on_action_completed(
        &self,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Vec<Effect>, EngineError> {
        let Some(node) = event.node_id.as_deref() else {
            return Ok(vec![]);
        };
        let (step, is_save) = base_step(node);
        let result = event.result().cloned().unwrap_or(Value::Null);

        if is_save {
            return Ok(vec![Effect::Append(
                NewEvent::new(event.execution_id, EventType::SaveEmitted, EventStatus::Success)
                    .with_node(node)
                    .with_parent(event.event_id)
                    .with_result(result),
            )]);
        }

        if let Some(index) = event.iterator_index {
            if snapshot.step_status(step).is_terminal() {
                return Ok(vec![]);
            }
            return Ok(vec![Effect::Append(
                NewEvent::new(
                    event.execution_id,
                    EventType::IteratorIterationCompleted,
                    EventStatus::Success,
                )
                .with_node(step)
                .with_iterator_index(index)
                .with_parent(event.event_id)
                .with_result(result),
            )]);
        }

        if snapshot.step_status(step).is_terminal() {
            return Ok(vec![]);
        }
        Ok(vec![Effect::Append(
            NewEvent::new(event.execution_id, EventType::StepCompleted, EventStatus::Success)
                .with_node(step)
                .with_parent(event.event_id)
                .with_result(result),
        )])
    }

    fn on_action_failed(
        &self,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Vec<Effect>, EngineError> {
        let will_retry = event
            .payload
            .get("will_retry")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let dead_letter = event
            .payload
            .get("dead_letter")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Retries stay inside the queue; the dead-letter path appends its
        // own terminal step event in the same transaction as the nack.
        if will_retry || dead_letter {
            return Ok(vec![]);
        }

        let Some(node) = event.node_id.as_deref() else {
            return Ok(vec![]);
        };
        let (step, is_save) = base_step(node);
        let error = event
            .error
            .clone()
            .unwrap_or_else(|| ErrorObject::action("action failed"));

        if is_save {
            return Ok(vec![Effect::Append(
                NewEvent::new(event.execution_id, EventType::SaveEmitted, EventStatus::Failed)
                    .with_node(node)
                    .with_parent(event.event_id)
                    .with_error(error),
            )]);
        }

        if snapshot.step_status(step).is_terminal() {
            return Ok(vec![]);
        }

        let mut failed = NewEvent::new(
            event.execution_id,
            EventType::StepFailed,
            EventStatus::Failed,
        )
        .with_node(step)
        .with_parent(event.event_id)
        .with_attempt(event.attempt)
        .with_error(error);
        if let Some(index) = event.iterator_index {
            failed = failed.with_iterator_index(index);
        }
        Ok(vec![Effect::Append(failed)])
    }

    // =========================================================================
    // Step completion: vars, save, routing
    // =========================================================================

    fn on_step_succeeded(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Vec<Effect>, EngineError> {
        let Some(node) = event.node_id.as_deref() else {
            return Ok(vec![]);
        };
        let (step_name, is_save) = base_step(node);
        if is_save {
            return Ok(vec![]);
        }
        let Some(step) = playbook.step(step_name) else {
            // Mirrored or foreign node ids are not routable here.
            return Ok(vec![]);
        };

        let result = event.result().cloned().unwrap_or(Value::Null);
        let mut effects = Vec::new();
        let layers = snapshot.build_layers(step_name);

        // Extracted variables become visible to conditions and edge args
        // of this same routing cycle.
        let mut extracted = JsonMap::new();
        if let Some(vars) = &step.vars {
            let vars_layers = layers.clone().bind("result", result.clone());
            for (name, template) in vars {
                let value = self.engine.render_value(template, &vars_layers)?;
                extracted.insert(name.clone(), value.clone());
                let mut values = JsonMap::new();
                values.insert(name.clone(), value);
                effects.push(Effect::Append(
                    NewEvent::new(
                        event.execution_id,
                        EventType::VariablesSet,
                        EventStatus::Success,
                    )
                    .with_node(step_name)
                    .with_parent(event.event_id)
                    .with_payload(serde_json::json!({
                        "values": values,
                        "kind": "user_defined",
                    })),
                ));
            }
        }

        // The save block runs as a synthetic downstream action; its
        // failures are recorded via `save_emitted` and never fail this
        // step.
        if let Some(save) = &step.save {
            let save_ctx = layers
                .clone()
                .bind_map(extracted.clone())
                .bind("this", serde_json::json!({ "data": result.clone() }));
            let spec = ActionSpec::new(save.tool, save_ctx.to_value())
                .with_config(save.data.clone())
                .with_auth(
                    save.auth
                        .as_deref()
                        .map(|name| playbook.resolve_auth(name).to_string()),
                )
                .with_timeout_secs(step.timeout_secs.unwrap_or(crate::action::DEFAULT_TIMEOUT_SECS));
            effects.push(Effect::Enqueue(
                QueueSpec::save(event.execution_id, step_name, spec)
                    .with_pool(step.pool.clone())
                    .with_runtime(step.runtime.clone()),
            ));
        }

        let route_layers = layers.bind_map(extracted).bind("result", result);
        let fired = self.fire_edges(step, &route_layers, false)?;
        effects.extend(self.schedule_targets(playbook, snapshot, event, &route_layers, fired)?);
        Ok(effects)
    }

    fn on_step_failed(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Vec<Effect>, EngineError> {
        let Some(node) = event.node_id.as_deref() else {
            return Ok(vec![]);
        };
        let (step_name, is_save) = base_step(node);
        if is_save {
            return Ok(vec![]);
        }
        let error = event
            .error
            .clone()
            .unwrap_or_else(|| ErrorObject::action("step failed"));

        // A per-iteration failure sinks the whole iterator: outstanding
        // ready entries are withdrawn and the iterator step fails as a
        // unit, which re-enters here without an index.
        if let Some(index) = event.iterator_index {
            if snapshot.step_status(step_name).is_terminal() {
                return Ok(vec![]);
            }
            return Ok(vec![
                Effect::CancelReady {
                    node_id: Some(step_name.to_string()),
                },
                Effect::Append(
                    NewEvent::new(
                        event.execution_id,
                        EventType::StepFailed,
                        EventStatus::Failed,
                    )
                    .with_node(step_name)
                    .with_parent(event.event_id)
                    .with_error(
                        ErrorObject::new(
                            error.kind,
                            format!("iteration {index} failed: {}", error.message),
                        )
                        .with_retryable(false),
                    ),
                ),
            ]);
        }

        // Error routes: conditional edges evaluated with the failure bound
        // as `error`. Unconditional edges are success routes and do not
        // fire.
        if let Some(step) = playbook.step(step_name) {
            let layers = snapshot
                .build_layers(step_name)
                .bind("error", serde_json::to_value(&error)?);
            let fired = self.fire_edges(step, &layers, true)?;
            if !fired.is_empty() {
                return self.schedule_targets(playbook, snapshot, event, &layers, fired);
            }
        }

        // No error route matched: the execution fails with the offending
        // step and error, and pending work is withdrawn.
        Ok(vec![
            Effect::CancelReady { node_id: None },
            Effect::Append(
                NewEvent::new(
                    event.execution_id,
                    EventType::ExecutionFailed,
                    EventStatus::Failed,
                )
                .with_parent(event.event_id)
                .with_payload(serde_json::json!({ "step": step_name }))
                .with_error(error),
            ),
        ])
    }

    // =========================================================================
    // Iterators
    // =========================================================================

    fn on_iteration_completed(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        event: &Event,
    ) -> Result<Vec<Effect>, EngineError> {
        let Some(node) = event.node_id.as_deref() else {
            return Ok(vec![]);
        };
        let (step_name, _) = base_step(node);
        let Some(step_snap) = snapshot.step(step_name) else {
            return Ok(vec![]);
        };
        if step_snap.status.is_terminal() {
            return Ok(vec![]);
        }
        let Some(iterator) = step_snap.iterator.as_ref() else {
            return Ok(vec![]);
        };
        let Some(step) = playbook.step(step_name) else {
            return Ok(vec![]);
        };

        let mut effects = Vec::new();

        // Sequential mode releases the next index only after the previous
        // one reached a terminal state.
        if iterator.mode == IterMode::Sequential {
            if let Some(index) = event.iterator_index {
                let next = index + 1;
                if (next as usize) < iterator.expected
                    && !iterator.results.contains_key(&next)
                    && !iterator.failed.contains_key(&next)
                {
                    if let Some(item) = iterator.items.get(next as usize) {
                        let layers = snapshot.build_layers(step_name);
                        effects.push(Effect::Enqueue(self.iterator_entry(
                            playbook, snapshot, step, step_name, &layers, next, item,
                        )?));
                    }
                }
            }
        }

        // Fan-in: every expected index present, in original index order
        // regardless of completion interleaving.
        if iterator.results.len() >= iterator.expected {
            effects.push(Effect::Append(
                NewEvent::new(
                    event.execution_id,
                    EventType::IteratorCompleted,
                    EventStatus::Success,
                )
                .with_node(step_name)
                .with_parent(event.event_id)
                .with_result(Value::Array(iterator.ordered_results())),
            ));
        }

        Ok(effects)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Effects that make `step_name` run: start event plus whatever the
    /// step's shape requires. A step that already left `pending` is not
    /// scheduled again.
    fn schedule_step(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        step_name: &str,
        cause: &Event,
        extra_locals: JsonMap,
    ) -> Result<Vec<Effect>, EngineError> {
        let step = playbook
            .step(step_name)
            .ok_or_else(|| EngineError::UnknownStep(step_name.to_string()))?;

        if snapshot.step_status(step_name) != StepStatus::Pending {
            return Ok(vec![]);
        }

        let execution_id = cause.execution_id;
        let started = NewEvent::new(execution_id, EventType::StepStarted, EventStatus::Started)
            .with_node(step_name)
            .with_parent(cause.event_id);

        let layers = snapshot
            .build_layers(step_name)
            .bind_map(extra_locals.clone());

        // `end` completes the execution.
        if step_name == END_STEP {
            return Ok(vec![
                Effect::Append(started),
                Effect::Append(
                    NewEvent::new(execution_id, EventType::StepCompleted, EventStatus::Success)
                        .with_node(step_name)
                        .with_parent(cause.event_id)
                        .with_result(Value::Null),
                ),
                Effect::Append(
                    NewEvent::new(
                        execution_id,
                        EventType::ExecutionCompleted,
                        EventStatus::Success,
                    )
                    .with_parent(cause.event_id),
                ),
            ]);
        }

        match (step.tool, step.name.as_deref()) {
            // Pure router: completes immediately, then routes.
            (None, None) => Ok(vec![
                Effect::Append(started),
                Effect::Append(
                    NewEvent::new(execution_id, EventType::StepCompleted, EventStatus::Success)
                        .with_node(step_name)
                        .with_parent(cause.event_id)
                        .with_result(Value::Null),
                ),
            ]),

            (Some(ActionKind::Iterator), _) => {
                self.expand_iterator(playbook, snapshot, step, step_name, cause, started, &layers)
            }

            (Some(ActionKind::Playbook), _) => {
                let payload = match step.inputs() {
                    Some(inputs) => Value::Object(self.engine.render_map(inputs, &layers)?),
                    None => Value::Object(JsonMap::new()),
                };
                let path = step.path.clone().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "sub-playbook step `{step_name}` is missing `path`"
                    ))
                })?;
                Ok(vec![
                    Effect::Append(started),
                    Effect::SpawnChild(ChildSpec {
                        step: step_name.to_string(),
                        path,
                        version: step.version,
                        payload,
                        parent_event_id: cause.event_id,
                    }),
                ])
            }

            // Worker-executed action, inline or by workbook reference.
            _ => {
                let spec = self.action_spec(playbook, step, &layers)?;
                let entry = QueueSpec::step(execution_id, step_name, spec)
                    .with_pool(step.pool.clone())
                    .with_runtime(self.runtime_of(playbook, step))
                    .with_max_attempts(
                        step.max_attempts.map(|n| n as i32).unwrap_or(DEFAULT_MAX_ATTEMPTS),
                    );
                Ok(vec![Effect::Append(started), Effect::Enqueue(entry)])
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_iterator(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        step: &StepDef,
        step_name: &str,
        cause: &Event,
        started: NewEvent,
        layers: &ContextLayers,
    ) -> Result<Vec<Effect>, EngineError> {
        let collection_expr = step.collection.as_deref().ok_or_else(|| {
            EngineError::Validation(format!("iterator step `{step_name}` has no `collection`"))
        })?;
        let element = step.element.as_deref().unwrap_or("item");
        let mode = step.mode.unwrap_or_default();

        let collection = self.engine.render_str(collection_expr, layers)?;
        let items = match collection {
            Value::Array(items) => items,
            other => {
                return Err(EngineError::Template(format!(
                    "iterator step `{step_name}`: collection must render to a sequence, got {}",
                    type_name(&other)
                )))
            }
        };

        let execution_id = cause.execution_id;
        let mut effects = vec![
            Effect::Append(started),
            Effect::Append(
                NewEvent::new(execution_id, EventType::IteratorExpanded, EventStatus::Started)
                    .with_node(step_name)
                    .with_parent(cause.event_id)
                    .with_payload(serde_json::json!({
                        "count": items.len(),
                        "mode": mode,
                        "element": element,
                        "items": items,
                    })),
            ),
        ];

        // Empty collection: the fan-in resolves immediately with an empty
        // result and downstream proceeds.
        if items.is_empty() {
            effects.push(Effect::Append(
                NewEvent::new(
                    execution_id,
                    EventType::IteratorCompleted,
                    EventStatus::Success,
                )
                .with_node(step_name)
                .with_parent(cause.event_id)
                .with_result(Value::Array(vec![])),
            ));
            return Ok(effects);
        }

        let upto = match mode {
            IterMode::Async => items.len(),
            IterMode::Sequential => 1,
        };
        for (index, item) in items.iter().take(upto).enumerate() {
            effects.push(Effect::Enqueue(self.iterator_entry(
                playbook,
                snapshot,
                step,
                step_name,
                layers,
                index as i32,
                item,
            )?));
        }

        Ok(effects)
    }

    /// Queue entry for one iterator element, with the element bound into
    /// the entry's local context under the configured name.
    #[allow(clippy::too_many_arguments)]
    fn iterator_entry(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        step: &StepDef,
        step_name: &str,
        base_layers: &ContextLayers,
        index: i32,
        item: &Value,
    ) -> Result<QueueSpec, EngineError> {
        let task_name = step.task.as_deref().ok_or_else(|| {
            EngineError::Validation(format!("iterator step `{step_name}` has no `task`"))
        })?;
        let task = playbook.task(task_name).ok_or_else(|| {
            EngineError::Validation(format!(
                "iterator step `{step_name}` references unknown task `{task_name}`"
            ))
        })?;
        let element = step.element.as_deref().unwrap_or("item");

        let layers = base_layers.clone().bind(element, item.clone());

        let auth = step
            .auth
            .as_deref()
            .or(task.auth.as_deref())
            .map(|name| playbook.resolve_auth(name).to_string());

        let spec = ActionSpec::new(task.tool, layers.to_value())
            .with_config(task.with.clone())
            .with_args(step.inputs().cloned().unwrap_or_default())
            .with_auth(auth)
            .with_timeout_secs(step.timeout_secs.unwrap_or(crate::action::DEFAULT_TIMEOUT_SECS));

        Ok(QueueSpec::step(snapshot.execution_id, step_name, spec)
            .with_iterator_index(index)
            .with_pool(step.pool.clone())
            .with_runtime(step.runtime.clone().or_else(|| task.runtime.clone()))
            .with_max_attempts(
                step.max_attempts.map(|n| n as i32).unwrap_or(DEFAULT_MAX_ATTEMPTS),
            ))
    }

    fn action_spec(
        &self,
        playbook: &Playbook,
        step: &StepDef,
        layers: &ContextLayers,
    ) -> Result<ActionSpec, EngineError> {
        let (kind, config, task_auth, _task_runtime) = match (&step.tool, &step.name) {
            (Some(kind), _) => (*kind, JsonMap::new(), None, None),
            (None, Some(reference)) => {
                let task = playbook.task(reference).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "step `{}` references unknown task `{reference}`",
                        step.step
                    ))
                })?;
                (
                    task.tool,
                    task.with.clone(),
                    task.auth.clone(),
                    task.runtime.clone(),
                )
            }
            (None, None) => {
                return Err(EngineError::Validation(format!(
                    "step `{}` has no action",
                    step.step
                )))
            }
        };

        let auth = step
            .auth
            .clone()
            .or(task_auth)
            .map(|name| playbook.resolve_auth(&name).to_string());

        Ok(ActionSpec::new(kind, layers.to_value())
            .with_config(config)
            .with_args(step.inputs().cloned().unwrap_or_default())
            .with_auth(auth)
            .with_timeout_secs(step.timeout_secs.unwrap_or(crate::action::DEFAULT_TIMEOUT_SECS)))
    }

    fn runtime_of(&self, playbook: &Playbook, step: &StepDef) -> Option<String> {
        step.runtime.clone().or_else(|| {
            step.name
                .as_deref()
                .and_then(|reference| playbook.task(reference))
                .and_then(|task| task.runtime.clone())
        })
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Evaluate a step's outbound edges and return the targets that fire,
    /// in order, with their edge args.
    ///
    /// With a `case` block, arms are tried in order and the first truthy
    /// one fires; unconditional `next` edges are the fallback when no arm
    /// matched. Without `case`, every `next` edge is evaluated
    /// independently and all truthy/unconditional edges fan out.
    ///
    /// In `error_routes` mode only conditional edges are considered.
    fn fire_edges(
        &self,
        step: &StepDef,
        layers: &ContextLayers,
        error_routes: bool,
    ) -> Result<Vec<(String, Option<JsonMap>)>, EngineError> {
        let mut fired: Vec<(String, Option<JsonMap>)> = Vec::new();
        let push = |targets: Vec<(String, Option<JsonMap>)>,
                    fired: &mut Vec<(String, Option<JsonMap>)>| {
            for (target, args) in targets {
                if !fired.iter().any(|(existing, _)| existing == &target) {
                    fired.push((target, args));
                }
            }
        };

        let mut case_matched = false;
        if let Some(case) = &step.case {
            for arm in case {
                if self.engine.eval_when(&arm.when, layers)?.fired() {
                    push(arm_targets(arm), &mut fired);
                    case_matched = true;
                    break;
                }
            }
        }

        if let Some(next) = &step.next {
            for edge in next {
                match edge {
                    Edge::Cond(arm) => {
                        if self.engine.eval_when(&arm.when, layers)?.fired() {
                            push(arm_targets(arm), &mut fired);
                        }
                    }
                    Edge::Name(name) if !error_routes && !case_matched => {
                        push(vec![(name.clone(), None)], &mut fired);
                    }
                    Edge::Direct(direct) if !error_routes && !case_matched => {
                        push(
                            vec![(direct.step.clone(), direct.args.clone())],
                            &mut fired,
                        );
                    }
                    _ => {}
                }
            }
        }

        Ok(fired)
    }

    /// Turn fired edges into scheduling effects. Edge args are rendered
    /// now, recorded as scoped `variables_set` events, and passed as the
    /// target's local bindings.
    fn schedule_targets(
        &self,
        playbook: &Playbook,
        snapshot: &Snapshot,
        cause: &Event,
        layers: &ContextLayers,
        fired: Vec<(String, Option<JsonMap>)>,
    ) -> Result<Vec<Effect>, EngineError> {
        let mut effects = Vec::new();
        for (target, args) in fired {
            let rendered = match args {
                Some(args) => self.engine.render_map(&args, layers)?,
                None => JsonMap::new(),
            };
            if !rendered.is_empty() {
                effects.push(Effect::Append(
                    NewEvent::new(
                        cause.execution_id,
                        EventType::VariablesSet,
                        EventStatus::Success,
                    )
                    .with_node(cause.node_id.clone().unwrap_or_default())
                    .with_parent(cause.event_id)
                    .with_payload(serde_json::json!({
                        "scope": target,
                        "values": rendered,
                        "kind": "computed",
                    })),
                ));
            }
            effects.extend(self.schedule_step(playbook, snapshot, &target, cause, rendered)?);
        }
        Ok(effects)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

fn arm_targets(arm: &CaseArm) -> Vec<(String, Option<JsonMap>)> {
    arm.then
        .iter()
        .map(|target| (target.clone(), arm.args.clone()))
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::parse;
    use serde_json::json;

    /// Minimal in-memory driver: stamps appended events into the stream,
    /// re-folds, and feeds each new event back into `decide`. Queue entries
    /// are collected; `complete` simulates a worker acking an entry.
    struct Harness {
        broker: Broker,
        playbook: Playbook,
        snapshot: Snapshot,
        events: Vec<Event>,
        queue: Vec<QueueSpec>,
        children: Vec<ChildSpec>,
        cancelled_nodes: Vec<Option<String>>,
    }

    impl Harness {
        fn start(text: &str, workload: Value) -> Self {
            let playbook = parse(text).unwrap().playbook;
            let mut harness = Self {
                broker: Broker::new(),
                playbook,
                snapshot: Snapshot::new(1),
                events: Vec::new(),
                queue: Vec::new(),
                children: Vec::new(),
                cancelled_nodes: Vec::new(),
            };
            harness.append(
                NewEvent::new(1, EventType::ExecutionStart, EventStatus::Started).with_payload(
                    json!({"path": "tests/t", "version": 1, "workload": workload}),
                ),
            );
            harness.drain();
            harness
        }

        fn append(&mut self, event: NewEvent) -> Event {
            let event_id = self.events.len() as i64 + 1;
            let event = event.into_event(event_id, chrono::Utc::now());
            self.snapshot.apply(&event);
            self.events.push(event.clone());
            event
        }

        /// Run decide over every event that has not been dispatched yet
        /// until the stream is quiet.
        fn drain(&mut self) {
            let mut cursor = 0;
            while cursor < self.events.len() {
                let event = self.events[cursor].clone();
                cursor += 1;
                let effects = self
                    .broker
                    .decide(&self.playbook, &self.snapshot, &event)
                    .unwrap();
                for effect in effects {
                    match effect {
                        Effect::Append(new_event) => {
                            self.append(new_event);
                        }
                        Effect::Enqueue(spec) => {
                            let fp = spec.fingerprint_at(0);
                            if !self.queue.iter().any(|q| q.fingerprint_at(0) == fp) {
                                self.queue.push(spec);
                            }
                        }
                        Effect::SpawnChild(child) => self.children.push(child),
                        Effect::CancelReady { node_id } => {
                            self.cancelled_nodes.push(node_id.clone());
                            self.queue.retain(|q| match &node_id {
                                Some(node) => &q.node_id != node,
                                None => false,
                            });
                        }
                    }
                }
            }
        }

        /// Simulate a worker completing the given queue entry.
        fn complete(&mut self, node_id: &str, index: Option<i32>, result: Value) {
            let pos = self
                .queue
                .iter()
                .position(|q| q.node_id == node_id && q.iterator_index == index)
                .unwrap_or_else(|| panic!("no queue entry for {node_id}/{index:?}"));
            let entry = self.queue.remove(pos);
            let mut event = NewEvent::new(1, EventType::ActionCompleted, EventStatus::Success)
                .with_node(entry.node_id.clone())
                .with_attempt(1)
                .with_result(result);
            if let Some(i) = entry.iterator_index {
                event = event.with_iterator_index(i);
            }
            self.append(event);
            self.drain();
        }

        fn event_types(&self) -> Vec<&'static str> {
            self.events.iter().map(|e| e.event_type.as_str()).collect()
        }
    }

    const LINEAR: &str = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: linear, path: tests/linear}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    args: {value: 42}
    next: [end]
  - step: end
"#;

    #[test]
    fn linear_flow_produces_the_expected_event_order() {
        let mut h = Harness::start(LINEAR, json!({}));
        // start is a router; s1 should now be enqueued.
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.queue[0].node_id, "s1");

        h.complete("s1", None, json!({"value": 42}));

        assert_eq!(
            h.event_types(),
            vec![
                "execution_start",
                "step_started",      // start
                "step_completed",    // start (router)
                "step_started",      // s1
                "action_completed",  // s1 (action_started is appended by the worker)
                "step_completed",    // s1
                "step_started",      // end
                "step_completed",    // end
                "execution_completed",
            ]
        );
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Completed);
        assert_eq!(h.snapshot.step_result("s1"), Some(&json!({"value": 42})));
    }

    #[test]
    fn duplicate_terminal_report_is_a_no_op() {
        let mut h = Harness::start(LINEAR, json!({}));
        h.complete("s1", None, json!({"value": 42}));
        let events_before = h.events.len();

        // A second, duplicate action_completed for the same step.
        h.append(
            NewEvent::new(1, EventType::ActionCompleted, EventStatus::Success)
                .with_node("s1")
                .with_attempt(1)
                .with_result(json!({"value": 42})),
        );
        h.drain();

        // Only the duplicate itself was recorded; no new transitions.
        assert_eq!(h.events.len(), events_before + 1);
    }

    const CONDITIONAL: &str = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: cond, path: tests/cond}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    next:
      - when: "{{ s1.x > 3 }}"
        then: [s_hot]
      - when: "{{ s1.x <= 3 }}"
        then: [s_cold]
  - step: s_hot
    tool: noop
    next: [end]
  - step: s_cold
    tool: noop
    next: [end]
  - step: end
"#;

    #[test]
    fn conditional_routing_fires_only_the_matching_branch() {
        let mut h = Harness::start(CONDITIONAL, json!({}));
        h.complete("s1", None, json!({"x": 5}));

        assert!(h.queue.iter().any(|q| q.node_id == "s_hot"));
        assert!(!h.queue.iter().any(|q| q.node_id == "s_cold"));
        assert_eq!(h.snapshot.step_status("s_cold"), StepStatus::Pending);
    }

    #[test]
    fn missing_variable_in_when_is_not_an_error() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    next:
      - when: "{{ ghost.value > 1 }}"
        then: [s2]
      - end
  - step: s2
    tool: noop
    next: [end]
  - step: end
"#;
        let mut h = Harness::start(text, json!({}));
        h.complete("s1", None, json!({}));
        // The conditional edge did not fire; the unconditional fallback did.
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Completed);
        assert_eq!(h.snapshot.step_status("s2"), StepStatus::Pending);
    }

    const CASE_FALLBACK: &str = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    case:
      - when: "{{ s1.x > 100 }}"
        then: [s_big]
    next: [s_default]
  - step: s_big
    tool: noop
    next: [end]
  - step: s_default
    tool: noop
    next: [end]
  - step: end
"#;

    #[test]
    fn case_miss_falls_back_to_unconditional_next() {
        let mut h = Harness::start(CASE_FALLBACK, json!({}));
        h.complete("s1", None, json!({"x": 1}));
        assert!(h.queue.iter().any(|q| q.node_id == "s_default"));
        assert!(!h.queue.iter().any(|q| q.node_id == "s_big"));
    }

    #[test]
    fn case_match_suppresses_the_fallback() {
        let mut h = Harness::start(CASE_FALLBACK, json!({}));
        h.complete("s1", None, json!({"x": 500}));
        assert!(h.queue.iter().any(|q| q.node_id == "s_big"));
        assert!(!h.queue.iter().any(|q| q.node_id == "s_default"));
    }

    const ITERATOR: &str = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: iter, path: tests/iter}
workload:
  cities: ["a", "b", "c"]
workbook:
  - name: shout
    tool: noop
    with: {city: "{{ city }}"}
workflow:
  - step: start
    next: [fan]
  - step: fan
    tool: iterator
    collection: "{{ workload.cities }}"
    element: city
    mode: async
    task: shout
    next: [end]
  - step: end
"#;

    #[test]
    fn async_iterator_enqueues_all_and_preserves_index_order() {
        let mut h = Harness::start(ITERATOR, json!({"cities": ["a", "b", "c"]}));
        assert_eq!(h.queue.len(), 3);
        // Element values are bound into each entry's context.
        let ctx = &h.queue[1].spec.context;
        assert_eq!(ctx["city"], json!("b"));

        // Completions arrive out of order: C, A, B.
        h.complete("fan", Some(2), json!("C"));
        h.complete("fan", Some(0), json!("A"));
        h.complete("fan", Some(1), json!("B"));

        let fan = h.snapshot.step("fan").unwrap();
        assert_eq!(fan.result, Some(json!(["A", "B", "C"])));
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Completed);
    }

    #[test]
    fn sequential_iterator_releases_one_index_at_a_time() {
        let text = ITERATOR.replace("mode: async", "mode: sequential");
        let mut h = Harness::start(&text, json!({"cities": ["a", "b", "c"]}));
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.queue[0].iterator_index, Some(0));

        h.complete("fan", Some(0), json!("A"));
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.queue[0].iterator_index, Some(1));

        h.complete("fan", Some(1), json!("B"));
        h.complete("fan", Some(2), json!("C"));
        assert_eq!(
            h.snapshot.step_result("fan"),
            Some(&json!(["A", "B", "C"]))
        );
    }

    #[test]
    fn empty_iterator_completes_immediately() {
        let mut h = Harness::start(ITERATOR, json!({"cities": []}));
        assert!(h.queue.is_empty());
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Completed);
        assert_eq!(h.snapshot.step_result("fan"), Some(&json!([])));
    }

    #[test]
    fn iteration_failure_sinks_the_iterator_and_fails_the_execution() {
        let mut h = Harness::start(ITERATOR, json!({"cities": ["a", "b", "c"]}));
        assert_eq!(h.queue.len(), 3);

        // Index 1 dead-letters: the queue appends the per-iteration
        // step_failed after exhausting attempts.
        h.queue.retain(|q| q.iterator_index != Some(1));
        h.append(
            NewEvent::new(1, EventType::StepFailed, EventStatus::Failed)
                .with_node("fan")
                .with_iterator_index(1)
                .with_error(ErrorObject::dead_letter("attempts exhausted")),
        );
        h.drain();

        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Failed);
        // Remaining ready entries for the iterator were withdrawn.
        assert!(h.cancelled_nodes.contains(&Some("fan".to_string())));
        assert!(h.queue.is_empty());
    }

    #[test]
    fn unhandled_step_failure_fails_the_execution() {
        let mut h = Harness::start(LINEAR, json!({}));
        h.append(
            NewEvent::new(1, EventType::ActionFailed, EventStatus::Failed)
                .with_node("s1")
                .with_attempt(1)
                .with_payload(json!({"will_retry": false, "dead_letter": false}))
                .with_error(ErrorObject::action("boom")),
        );
        h.drain();

        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Failed);
        assert_eq!(h.snapshot.error.as_ref().unwrap().message, "boom");
        assert!(h.cancelled_nodes.contains(&None));
    }

    #[test]
    fn error_route_matches_on_error_kind() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    next:
      - when: "{{ error.kind == 'action_error' }}"
        then: [cleanup]
      - end
  - step: cleanup
    tool: noop
    next: [end]
  - step: end
"#;
        let mut h = Harness::start(text, json!({}));
        h.append(
            NewEvent::new(1, EventType::ActionFailed, EventStatus::Failed)
                .with_node("s1")
                .with_attempt(1)
                .with_payload(json!({"will_retry": false, "dead_letter": false}))
                .with_error(ErrorObject::action("logical failure")),
        );
        h.drain();

        // The error route fired instead of failing the execution.
        assert_ne!(h.snapshot.status, crate::state::ExecutionStatus::Failed);
        assert!(h.queue.iter().any(|q| q.node_id == "cleanup"));
    }

    #[test]
    fn retryable_action_failure_does_not_transition_the_step() {
        let mut h = Harness::start(LINEAR, json!({}));
        h.append(
            NewEvent::new(1, EventType::ActionFailed, EventStatus::Failed)
                .with_node("s1")
                .with_attempt(1)
                .with_payload(json!({"will_retry": true, "dead_letter": false}))
                .with_error(ErrorObject::transport("connection reset")),
        );
        h.drain();

        assert_eq!(h.snapshot.step_status("s1"), StepStatus::Started);
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Running);
    }

    #[test]
    fn vars_and_edge_args_become_bindings() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    vars:
      doubled: "{{ (result.x | int) * 2 }}"
    next:
      - step: s2
        args: {incoming: "{{ doubled }}"}
  - step: s2
    tool: noop
    next: [end]
  - step: end
"#;
        let mut h = Harness::start(text, json!({}));
        h.complete("s1", None, json!({"x": 21}));

        assert_eq!(h.snapshot.variables["doubled"].value, json!(42));
        let s2 = h.snapshot.step("s2").unwrap();
        assert_eq!(s2.local_args["incoming"], json!(42));
        // The queue entry's context carries the binding for the worker.
        let entry = h.queue.iter().find(|q| q.node_id == "s2").unwrap();
        assert_eq!(entry.spec.context["incoming"], json!(42));
    }

    #[test]
    fn save_block_enqueues_a_synthetic_entry() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    save:
      tool: postgres
      data: {query: "INSERT {{ this.data.x }}"}
    next: [end]
  - step: end
"#;
        let mut h = Harness::start(text, json!({}));
        h.complete("s1", None, json!({"x": 7}));

        let save = h
            .queue
            .iter()
            .find(|q| q.entry_kind == crate::action::EntryKind::Save)
            .expect("save entry");
        assert_eq!(save.node_id, "s1::save");
        assert_eq!(save.spec.kind, ActionKind::Postgres);
        assert_eq!(save.spec.context["this"]["data"]["x"], json!(7));
        // The producing step completed regardless of the save outcome.
        assert_eq!(h.snapshot.step_status("s1"), StepStatus::Completed);
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Completed);
    }

    #[test]
    fn subplaybook_step_spawns_a_child_and_completes_on_mirror() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [call]
  - step: call
    tool: playbook
    path: tests/child
    args: {n: 5}
    next: [end]
  - step: end
"#;
        let mut h = Harness::start(text, json!({}));
        assert_eq!(h.children.len(), 1);
        assert_eq!(h.children[0].path, "tests/child");
        assert_eq!(h.children[0].payload, json!({"n": 5}));
        assert_eq!(h.snapshot.step_status("call"), StepStatus::Started);

        // The composer mirrors the child's terminal result into the parent.
        h.append(
            NewEvent::new(1, EventType::SubplaybookCompleted, EventStatus::Success)
                .with_node("call")
                .with_payload(json!({"child_execution_id": 2, "result": {"sum": 10}})),
        );
        h.drain();

        assert_eq!(h.snapshot.step_result("call"), Some(&json!({"sum": 10})));
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Completed);
    }

    #[test]
    fn cancelled_execution_ignores_late_outcomes() {
        let mut h = Harness::start(LINEAR, json!({}));
        assert_eq!(h.queue.len(), 1);
        h.append(
            NewEvent::new(1, EventType::ExecutionFailed, EventStatus::Cancelled)
                .with_error(ErrorObject::cancelled("cancelled by operator")),
        );
        h.drain();
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Cancelled);

        // The leased entry's late terminal report is recorded but triggers
        // no further scheduling.
        let events_before = h.events.len();
        h.append(
            NewEvent::new(1, EventType::ActionCompleted, EventStatus::Success)
                .with_node("s1")
                .with_attempt(1)
                .with_result(json!({"value": 42})),
        );
        h.drain();
        assert_eq!(h.events.len(), events_before + 1);
        assert_eq!(h.snapshot.status, crate::state::ExecutionStatus::Cancelled);
    }

    #[test]
    fn fan_out_schedules_every_target_once() {
        let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: t, path: tests/t}
workflow:
  - step: start
    next: [a, b]
  - step: a
    tool: noop
    next: [join]
  - step: b
    tool: noop
    next: [join]
  - step: join
    tool: noop
    next: [end]
  - step: end
"#;
        let mut h = Harness::start(text, json!({}));
        assert_eq!(h.queue.len(), 2);

        h.complete("a", None, json!("ra"));
        // First parent completion schedules the join.
        assert!(h.queue.iter().any(|q| q.node_id == "join"));
        let join_entries = h.queue.iter().filter(|q| q.node_id == "join").count();

        h.complete("b", None, json!("rb"));
        // Second parent does not schedule it again.
        assert_eq!(
            h.queue.iter().filter(|q| q.node_id == "join").count(),
            join_entries
        );
    }
}

