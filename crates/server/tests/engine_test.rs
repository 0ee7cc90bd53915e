//! End-to-end engine tests over the in-memory store: broker daemon,
//! composer and worker runtime wired together exactly as in production,
//! minus PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use playmill_core::event::EventType;
use playmill_core::{ActionKind, ErrorObject, ExecutionStatus, Snapshot};
use playmill_server::services::{CatalogService, ExecutionService, StartRequest};
use playmill_server::{BrokerConfig, BrokerDaemon, Composer};
use playmill_store::{EngineStore, LeaseRequest, MemoryEngineStore};
use playmill_worker::actions::{Action, ActionInvocation, ActionRegistry, NoopAction};
use playmill_worker::{RetryPolicy, WorkerConfig, WorkerRuntime};

struct Engine {
    store: Arc<MemoryEngineStore>,
    daemon: Arc<BrokerDaemon>,
    worker: WorkerRuntime<MemoryEngineStore>,
    executions: ExecutionService,
    catalog: CatalogService,
}

impl Engine {
    fn new(extra_actions: Vec<Arc<dyn Action>>) -> Self {
        let store = Arc::new(MemoryEngineStore::new());
        let dyn_store: Arc<dyn EngineStore> = store.clone();

        let catalog = CatalogService::new(dyn_store.clone());
        let executions = ExecutionService::new(dyn_store.clone());
        let composer = Composer::new(dyn_store.clone(), executions.clone());
        let daemon = Arc::new(BrokerDaemon::new(
            dyn_store.clone(),
            catalog.clone(),
            composer,
            BrokerConfig::default(),
        ));

        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(NoopAction));
        for action in extra_actions {
            registry.register(action);
        }
        let worker_config = WorkerConfig {
            max_concurrency: 4,
            retry: RetryPolicy::fixed(Duration::from_millis(0)),
            ..WorkerConfig::default()
        };
        let worker = WorkerRuntime::new(store.clone(), registry, worker_config);

        Self {
            store,
            daemon,
            worker,
            executions,
            catalog,
        }
    }

    async fn register(&self, text: &str) {
        self.catalog.register(text).await.expect("register");
    }

    async fn start(&self, path: &str, payload: Value) -> i64 {
        self.executions
            .start(StartRequest {
                path: path.to_string(),
                version: None,
                payload,
                merge: true,
                parent: None,
            })
            .await
            .expect("start")
            .execution_id
    }

    /// Alternate broker and worker passes until the execution terminates
    /// or the budget runs out.
    async fn run_to_completion(&self, execution_id: i64) -> Snapshot {
        for _ in 0..50 {
            self.daemon.tick().await.expect("tick");
            self.worker.drain_once().await.expect("drain");
            let record = self.store.get_execution(execution_id).await.unwrap();
            if record.status.is_terminal() {
                // Flush any terminal dispatch (status sync, mirroring).
                self.daemon.tick().await.expect("final tick");
                break;
            }
        }
        self.snapshot(execution_id).await
    }

    async fn snapshot(&self, execution_id: i64) -> Snapshot {
        self.executions.snapshot(execution_id).await.unwrap()
    }

    async fn event_types(&self, execution_id: i64) -> Vec<String> {
        self.store
            .load_events(execution_id, None, None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_type.as_str().to_string())
            .collect()
    }
}

/// Fails with a transport error on the first `failures` attempts, then
/// returns its config.
struct FlakyHttp {
    failures: i32,
}

#[async_trait]
impl Action for FlakyHttp {
    fn kind(&self) -> ActionKind {
        ActionKind::Http
    }

    async fn invoke(&self, invocation: ActionInvocation) -> Result<Value, ErrorObject> {
        if invocation.attempt <= self.failures {
            Err(ErrorObject::transport("connection reset by peer"))
        } else {
            Ok(Value::Object(invocation.config))
        }
    }
}

const LINEAR: &str = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: linear, path: e2e/linear}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    args: {value: 42}
    next: [end]
  - step: end
"#;

#[tokio::test]
async fn linear_success_produces_the_contract_event_order() {
    let engine = Engine::new(vec![]);
    engine.register(LINEAR).await;
    let execution_id = engine.start("e2e/linear", json!({})).await;

    let snapshot = engine.run_to_completion(execution_id).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.step_result("s1"), Some(&json!({"value": 42})));
    assert_eq!(
        engine.event_types(execution_id).await,
        vec![
            "execution_start",
            "step_started",
            "step_completed",
            "step_started",
            "action_started",
            "action_completed",
            "step_completed",
            "step_started",
            "step_completed",
            "execution_completed",
        ]
    );
}

#[tokio::test]
async fn conditional_routing_starts_only_the_hot_branch() {
    let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: cond, path: e2e/cond}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    args: {x: 5}
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
    let engine = Engine::new(vec![]);
    engine.register(text).await;
    let execution_id = engine.start("e2e/cond", json!({})).await;

    let snapshot = engine.run_to_completion(execution_id).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert!(snapshot.step("s_hot").is_some());
    assert!(snapshot.step_result("s_hot").is_some());
    // s_cold never started: no trace of it in the snapshot.
    assert!(snapshot
        .step("s_cold")
        .map(|s| s.status == playmill_core::StepStatus::Pending)
        .unwrap_or(true));
}

const ITERATOR: &str = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: iter, path: e2e/iter}
workload:
  cities: []
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

#[tokio::test]
async fn async_iterator_preserves_index_order_under_reordered_completions() {
    let engine = Engine::new(vec![]);
    engine.register(ITERATOR).await;
    let execution_id = engine
        .start("e2e/iter", json!({"cities": ["a", "b", "c"]}))
        .await;

    // Expand the iterator but do not let the worker run yet.
    engine.daemon.tick().await.unwrap();
    assert_eq!(engine.store.ready_count(), 3);

    // Simulate three workers finishing out of order: C, A, B.
    let request = LeaseRequest {
        worker_id: "manual".into(),
        pool: "default".into(),
        runtime: None,
        max_entries: 3,
        lease_duration: Duration::from_secs(60),
    };
    let mut leased = engine.store.lease_entries(request).await.unwrap();
    leased.sort_by_key(|entry| entry.iterator_index);
    for index in [2usize, 0, 1] {
        let entry = &leased[index];
        let city = entry.spec.context["city"].as_str().unwrap().to_uppercase();
        let mut event = playmill_core::NewEvent::new(
            execution_id,
            EventType::ActionCompleted,
            playmill_core::EventStatus::Success,
        )
        .with_node(entry.node_id.clone())
        .with_attempt(entry.attempt_count)
        .with_result(json!(city));
        event = event.with_iterator_index(entry.iterator_index.unwrap());
        engine
            .store
            .ack(entry.queue_id, "manual", event)
            .await
            .unwrap();
    }

    let snapshot = engine.run_to_completion(execution_id).await;
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(
        snapshot.step_result("fan"),
        Some(&json!(["A", "B", "C"]))
    );
}

#[tokio::test]
async fn empty_iterator_collection_completes_immediately() {
    let engine = Engine::new(vec![]);
    engine.register(ITERATOR).await;
    let execution_id = engine.start("e2e/iter", json!({"cities": []})).await;

    let snapshot = engine.run_to_completion(execution_id).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.step_result("fan"), Some(&json!([])));
    let types = engine.event_types(execution_id).await;
    assert!(types.contains(&"iterator_expanded".to_string()));
    assert!(types.contains(&"iterator_completed".to_string()));
}

#[tokio::test]
async fn retry_then_succeed_advances_attempts() {
    let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: retry, path: e2e/retry}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: http
    args: {url: "http://example.test"}
    max_attempts: 5
    next: [end]
  - step: end
"#;
    let engine = Engine::new(vec![Arc::new(FlakyHttp { failures: 2 })]);
    engine.register(text).await;
    let execution_id = engine.start("e2e/retry", json!({})).await;

    let snapshot = engine.run_to_completion(execution_id).await;
    assert_eq!(snapshot.status, ExecutionStatus::Completed);

    let events = engine.store.load_events(execution_id, None, None).await.unwrap();
    let count = |ty: EventType| events.iter().filter(|e| e.event_type == ty).count();
    assert_eq!(count(EventType::ActionStarted), 3);
    assert_eq!(count(EventType::ActionFailed), 2);
    assert_eq!(count(EventType::ActionCompleted), 1);
    assert_eq!(count(EventType::StepFailed), 0);

    let attempts: Vec<i32> = events
        .iter()
        .filter(|e| e.event_type == EventType::ActionStarted)
        .map(|e| e.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    // The two failures were retries, not terminal reports.
    assert!(events
        .iter()
        .filter(|e| e.event_type == EventType::ActionFailed)
        .all(|e| e.payload["will_retry"] == json!(true)));
}

#[tokio::test]
async fn attempts_exhausted_dead_letters_and_fails_the_execution() {
    let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: dead, path: e2e/dead}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: http
    args: {url: "http://example.test"}
    max_attempts: 2
    next: [end]
  - step: end
"#;
    let engine = Engine::new(vec![Arc::new(FlakyHttp { failures: 10 })]);
    engine.register(text).await;
    let execution_id = engine.start("e2e/dead", json!({})).await;

    let snapshot = engine.run_to_completion(execution_id).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(
        snapshot.error.as_ref().unwrap().kind,
        playmill_core::ErrorKind::DeadLetter
    );
    let stats = engine.store.queue_stats().await.unwrap();
    assert_eq!(stats.dead, 1);
}

#[tokio::test]
async fn subplaybook_mirrors_the_child_result_into_the_parent() {
    let child = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: child, path: e2e/child}
workload:
  n: 0
workflow:
  - step: start
    next: [compute]
  - step: compute
    tool: noop
    args: {sum: "{{ (workload.n | int) * 2 }}"}
    next: [end]
  - step: end
"#;
    let parent = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: parent, path: e2e/parent}
workflow:
  - step: start
    next: [call]
  - step: call
    tool: playbook
    path: e2e/child
    return_step: compute
    args: {n: 5}
    next: [end]
  - step: end
"#;
    let engine = Engine::new(vec![]);
    engine.register(child).await;
    engine.register(parent).await;
    let execution_id = engine.start("e2e/parent", json!({})).await;

    let snapshot = engine.run_to_completion(execution_id).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.step_result("call"), Some(&json!({"sum": 10})));

    let parent_types = engine.event_types(execution_id).await;
    assert!(parent_types.contains(&"subplaybook_invoked".to_string()));
    assert!(parent_types.contains(&"subplaybook_completed".to_string()));

    // The child ran as its own execution with its own stream.
    let children = engine
        .store
        .list_executions(playmill_store::ExecutionFilter {
            parent_execution_id: Some(execution_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    let child_types = engine.event_types(children[0].execution_id).await;
    assert_eq!(child_types.first().map(String::as_str), Some("execution_start"));
    assert!(child_types.contains(&"execution_completed".to_string()));
    assert_eq!(children[0].root_execution_id, execution_id);
}

#[tokio::test]
async fn cancellation_clears_ready_work_and_ignores_late_outcomes() {
    let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: cancel, path: e2e/cancel}
workflow:
  - step: start
    next: [s1, s2]
  - step: s1
    tool: noop
    next: [end]
  - step: s2
    tool: noop
    next: [end]
  - step: end
"#;
    let engine = Engine::new(vec![]);
    engine.register(text).await;
    let execution_id = engine.start("e2e/cancel", json!({})).await;

    // Schedule both branches; lease one of them like a busy worker.
    engine.daemon.tick().await.unwrap();
    assert_eq!(engine.store.ready_count(), 2);
    let leased = engine
        .store
        .lease_entries(LeaseRequest {
            worker_id: "slow-worker".into(),
            pool: "default".into(),
            runtime: None,
            max_entries: 1,
            lease_duration: Duration::from_secs(60),
        })
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);

    engine.executions.cancel(execution_id).await.unwrap();

    // Ready entries are gone; the leased one keeps running.
    assert_eq!(engine.store.ready_count(), 0);
    assert_eq!(engine.store.leased_count(), 1);

    // The slow worker eventually reports; the outcome is recorded but
    // never scheduled on.
    let entry = &leased[0];
    engine
        .store
        .ack(
            entry.queue_id,
            "slow-worker",
            playmill_core::NewEvent::new(
                execution_id,
                EventType::ActionCompleted,
                playmill_core::EventStatus::Success,
            )
            .with_node(entry.node_id.clone())
            .with_attempt(entry.attempt_count)
            .with_result(json!({"late": true})),
        )
        .await
        .unwrap();
    engine.daemon.tick().await.unwrap();

    let snapshot = engine.snapshot(execution_id).await;
    assert_eq!(snapshot.status, ExecutionStatus::Cancelled);
    assert!(snapshot.cancelled);
    // Neither branch reached a step_completed, and end never ran.
    assert!(snapshot.step("end").is_none());

    let types = engine.event_types(execution_id).await;
    assert!(types.contains(&"action_completed".to_string()));
    assert!(!types.contains(&"execution_completed".to_string()));
}

#[tokio::test]
async fn vars_save_and_edge_args_flow_through_the_stack() {
    let text = r#"
apiVersion: playmill/v1
kind: Playbook
metadata: {name: flow, path: e2e/flow}
workflow:
  - step: start
    next: [s1]
  - step: s1
    tool: noop
    args: {x: 21}
    vars:
      doubled: "{{ (result.x | int) * 2 }}"
    save:
      tool: noop
      data: {saved: "{{ this.data.x }}"}
    next:
      - step: s2
        args: {incoming: "{{ doubled }}"}
  - step: s2
    tool: noop
    args: {echo: "{{ incoming }}"}
    next: [end]
  - step: end
"#;
    let engine = Engine::new(vec![]);
    engine.register(text).await;
    let execution_id = engine.start("e2e/flow", json!({})).await;

    let snapshot = engine.run_to_completion(execution_id).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.variables["doubled"].value, json!(42));
    assert_eq!(snapshot.step_result("s2"), Some(&json!({"echo": 42})));

    let types = engine.event_types(execution_id).await;
    assert!(types.contains(&"variables_set".to_string()));
    assert!(types.contains(&"save_emitted".to_string()));
}
