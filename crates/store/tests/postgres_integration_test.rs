//! PostgreSQL integration tests.
//!
//! These require a live database:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/playmill_test \
//!     cargo test -p playmill-store -- --ignored --test-threads=1
//! ```

use std::time::Duration;

use playmill_core::action::{ActionSpec, QueueSpec};
use playmill_core::event::{EventStatus, EventType, NewEvent};
use playmill_core::{ActionKind, ErrorObject};
use playmill_store::{
    EngineStore, LeaseRequest, NackOutcome, NewExecution, PgEngineStore,
};
use serde_json::json;

async fn store() -> PgEngineStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let pool = sqlx::PgPool::connect(&url).await.expect("connect");
    let store = PgEngineStore::new(pool, None);
    store.migrate().await.expect("migrate");
    store
}

async fn fresh_execution(store: &PgEngineStore) -> i64 {
    store
        .create_execution(NewExecution {
            path: "tests/integration".into(),
            version: 1,
            parent: None,
        })
        .await
        .expect("create execution")
        .execution_id
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn event_ids_are_contiguous_and_deduplicated() {
    let store = store().await;
    let execution_id = fresh_execution(&store).await;

    let first = store
        .append_events(vec![
            NewEvent::new(execution_id, EventType::ExecutionStart, EventStatus::Started)
                .with_payload(json!({"path": "tests/integration", "version": 1})),
            NewEvent::new(execution_id, EventType::StepStarted, EventStatus::Started)
                .with_node("start"),
        ])
        .await
        .unwrap();
    assert_eq!(first[0].event_id, 1);
    assert_eq!(first[1].event_id, 2);

    // Replaying a logical event returns the prior id without writing.
    let replay = store
        .append_events(vec![NewEvent::new(
            execution_id,
            EventType::StepStarted,
            EventStatus::Started,
        )
        .with_node("start")])
        .await
        .unwrap();
    assert!(replay[0].deduplicated);
    assert_eq!(replay[0].event_id, 2);

    let events = store.load_events(execution_id, None, None).await.unwrap();
    let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn lease_is_exclusive_across_concurrent_lessors() {
    let store = store().await;
    let execution_id = fresh_execution(&store).await;

    store
        .append_with_queue(
            vec![],
            vec![QueueSpec::step(
                execution_id,
                "s1",
                ActionSpec::new(ActionKind::Noop, json!({})),
            )],
        )
        .await
        .unwrap();

    let request = |worker: &str| LeaseRequest {
        worker_id: worker.to_string(),
        pool: "default".to_string(),
        runtime: None,
        max_entries: 10,
        lease_duration: Duration::from_secs(60),
    };

    let (a, b) = tokio::join!(
        store.lease_entries(request("worker-a")),
        store.lease_entries(request("worker-b")),
    );
    let total = a.unwrap().len() + b.unwrap().len();
    assert_eq!(total, 1);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn nack_until_dead_appends_the_dead_letter_failure() {
    let store = store().await;
    let execution_id = fresh_execution(&store).await;

    store
        .append_with_queue(
            vec![],
            vec![QueueSpec::step(
                execution_id,
                "s1",
                ActionSpec::new(ActionKind::Noop, json!({})),
            )
            .with_max_attempts(2)],
        )
        .await
        .unwrap();

    let request = LeaseRequest {
        worker_id: "w".to_string(),
        pool: "default".to_string(),
        runtime: None,
        max_entries: 1,
        lease_duration: Duration::from_secs(60),
    };

    let leased = store.lease_entries(request.clone()).await.unwrap();
    let outcome = store
        .nack(
            leased[0].queue_id,
            "w",
            ErrorObject::transport("reset"),
            Duration::from_secs(0),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, NackOutcome::Requeued { .. }));

    let leased = store.lease_entries(request).await.unwrap();
    assert_eq!(leased[0].attempt_count, 2);
    let outcome = store
        .nack(
            leased[0].queue_id,
            "w",
            ErrorObject::transport("reset"),
            Duration::from_secs(0),
        )
        .await
        .unwrap();
    assert_eq!(outcome, NackOutcome::Dead);

    let failed = store
        .latest_event(execution_id, EventType::StepFailed)
        .await
        .unwrap()
        .expect("step_failed appended on dead letter");
    assert_eq!(
        failed.error.unwrap().kind,
        playmill_core::ErrorKind::DeadLetter
    );
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database"]
async fn catalog_register_get_round_trip() {
    let store = store().await;
    let path = format!("tests/roundtrip-{}", std::process::id());

    let v1 = store
        .register_playbook(&path, "content v1", json!({"steps": 2}))
        .await
        .unwrap();
    let v2 = store
        .register_playbook(&path, "content v2", json!({"steps": 3}))
        .await
        .unwrap();
    assert_eq!(v2, v1 + 1);

    let latest = store.get_playbook(&path, None).await.unwrap();
    assert_eq!(latest.version, v2);
    let pinned = store.get_playbook(&path, Some(v1)).await.unwrap();
    assert_eq!(pinned.content, "content v1");
}
