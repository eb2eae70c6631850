use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::*;
use crate::events::{
    AggregateEventGroup, Artifact, Commit, ExecutionContext, UncommittedEvent, EVENT_LOG_STREAM,
};
use crate::interfaces::event_log::{EventFetcher, EventLog, StorageError};
use crate::interfaces::state_store::ProcessorStateStore;
use crate::processing::state::{StreamProcessorId, StreamProcessorState};

async fn make_pool() -> SqlitePool {
    // Single connection so the in-memory database is shared.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn make_log() -> (SqliteEventLog, SqlitePool) {
    let pool = make_pool().await;
    let log = SqliteEventLog::new(pool.clone());
    log.init().await.unwrap();
    (log, pool)
}

fn context() -> ExecutionContext {
    ExecutionContext::new(Uuid::new_v4(), "corr-1")
}

fn event(source: &str, content: serde_json::Value) -> UncommittedEvent {
    UncommittedEvent {
        event_source: source.to_string(),
        artifact: Artifact::new(Uuid::new_v4(), 1),
        public: false,
        content,
    }
}

#[tokio::test]
async fn test_commit_is_atomic_and_readable() {
    let (log, _) = make_log().await;
    let ctx = context();
    let root_type = Uuid::new_v4();

    let committed = log
        .persist_commit(
            &ctx,
            Commit {
                events: vec![event("E1", serde_json::json!({"a": 1}))],
                aggregate_groups: vec![AggregateEventGroup {
                    event_source: "E2".to_string(),
                    root_type,
                    expected_version: 0,
                    events: vec![
                        event("E2", serde_json::json!({"b": 1})),
                        event("E2", serde_json::json!({"b": 2})),
                    ],
                }],
            },
        )
        .await
        .unwrap();

    assert_eq!(committed.len(), 3);
    assert_eq!(
        committed.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(
        log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap(),
        3
    );
    assert_eq!(
        log.aggregate_version(ctx.tenant, "E2", root_type)
            .await
            .unwrap(),
        Some(2)
    );

    for position in 0..3 {
        let fetched = log
            .fetch(ctx.tenant, EVENT_LOG_STREAM, position)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.position, position);
        assert_eq!(fetched.event, committed[position as usize]);
    }
}

#[tokio::test]
async fn test_failed_commit_leaves_no_trace() {
    let (log, _) = make_log().await;
    let ctx = context();
    let root_type = Uuid::new_v4();

    log.persist_commit(
        &ctx,
        Commit::aggregate(AggregateEventGroup {
            event_source: "E1".to_string(),
            root_type,
            expected_version: 0,
            events: vec![event("E1", serde_json::json!({}))],
        }),
    )
    .await
    .unwrap();

    // Stale expected version: the whole commit, plain events included,
    // must be rolled back.
    let err = log
        .persist_commit(
            &ctx,
            Commit {
                events: vec![event("E9", serde_json::json!({}))],
                aggregate_groups: vec![AggregateEventGroup {
                    event_source: "E1".to_string(),
                    root_type,
                    expected_version: 0,
                    events: vec![event("E1", serde_json::json!({}))],
                }],
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::VersionConflict { .. }));
    assert_eq!(
        log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap(),
        1
    );
    assert!(log
        .fetch(ctx.tenant, EVENT_LOG_STREAM, 1)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        log.aggregate_version(ctx.tenant, "E1", root_type)
            .await
            .unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn test_watermark_bootstrap_from_last_entry() {
    let (log, pool) = make_log().await;
    let ctx = context();

    log.persist_commit(
        &ctx,
        Commit::plain(vec![
            event("E1", serde_json::json!({})),
            event("E1", serde_json::json!({})),
        ]),
    )
    .await
    .unwrap();

    // Simulate a store that predates watermark tracking.
    sqlx::query("DELETE FROM watermarks")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(
        log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap(),
        2
    );

    // The recovered watermark is persisted: appending continues gaplessly.
    let committed = log
        .persist_commit(&ctx, Commit::plain(vec![event("E1", serde_json::json!({}))]))
        .await
        .unwrap();
    assert_eq!(committed[0].sequence, 2);
}

#[tokio::test]
async fn test_empty_stream_has_no_watermark_record() {
    let (log, pool) = make_log().await;
    let ctx = context();

    // No data and no watermark: position 0, nothing persisted yet.
    assert_eq!(
        log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap(),
        0
    );

    let row = sqlx::query("SELECT COUNT(*) AS n FROM watermarks")
        .fetch_one(&pool)
        .await
        .unwrap();
    let n: i64 = row.get("n");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_find_next_on_event_log() {
    let (log, _) = make_log().await;
    let ctx = context();

    log.persist_commit(
        &ctx,
        Commit::plain(vec![
            event("E1", serde_json::json!({})),
            event("E2", serde_json::json!({})),
            event("E1", serde_json::json!({})),
        ]),
    )
    .await
    .unwrap();

    assert_eq!(
        log.find_next(ctx.tenant, EVENT_LOG_STREAM, "E2", 0)
            .await
            .unwrap(),
        Some(1)
    );
    assert_eq!(
        log.find_next(ctx.tenant, EVENT_LOG_STREAM, "E2", 2)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_derived_stream_roundtrip() {
    let (log, _) = make_log().await;
    let ctx = context();

    let committed = log
        .persist_commit(
            &ctx,
            Commit::plain(vec![
                event("E1", serde_json::json!({})),
                event("E2", serde_json::json!({})),
            ]),
        )
        .await
        .unwrap();

    let positions = log
        .append_to_stream(
            ctx.tenant,
            "projection",
            committed
                .iter()
                .map(|e| (e.event_source.clone(), e.clone()))
                .collect(),
        )
        .await
        .unwrap();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(log.next_position(ctx.tenant, "projection").await.unwrap(), 2);

    let fetched = log
        .fetch(ctx.tenant, "projection", 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.partition, "E1");
    assert_eq!(fetched.event, committed[0]);
    assert_eq!(
        log.find_next(ctx.tenant, "projection", "E2", 0).await.unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn test_fetch_for_aggregate() {
    let (log, _) = make_log().await;
    let ctx = context();
    let root_type = Uuid::new_v4();

    for expected in 0..2 {
        log.persist_commit(
            &ctx,
            Commit::aggregate(AggregateEventGroup {
                event_source: "E1".to_string(),
                root_type,
                expected_version: expected,
                events: vec![event("E1", serde_json::json!({"v": expected}))],
            }),
        )
        .await
        .unwrap();
    }

    let events = log.fetch_for_aggregate(ctx.tenant, "E1", root_type).await.unwrap();
    let versions: Vec<u64> = events
        .iter()
        .map(|e| e.aggregate.unwrap().applied_version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("events.db").display()
    );
    let ctx = context();

    let committed = {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        let log = SqliteEventLog::new(pool.clone());
        log.init().await.unwrap();
        let committed = log
            .persist_commit(&ctx, Commit::plain(vec![event("E1", serde_json::json!({"a": 1}))]))
            .await
            .unwrap();
        pool.close().await;
        committed
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .unwrap();
    let log = SqliteEventLog::new(pool);
    log.init().await.unwrap();

    assert_eq!(
        log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap(),
        1
    );
    let fetched = log
        .fetch(ctx.tenant, EVENT_LOG_STREAM, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.event, committed[0]);
}

#[tokio::test]
async fn test_state_store_upsert_and_load() {
    let pool = make_pool().await;
    let store = SqliteStateStore::new(pool);
    store.init().await.unwrap();

    let id = StreamProcessorId::new(Uuid::new_v4(), "projector", EVENT_LOG_STREAM);
    assert!(store.load(&id).await.unwrap().is_none());

    let state = StreamProcessorState::initial().with_position(3);
    store.persist(&id, &state).await.unwrap();
    assert_eq!(store.load(&id).await.unwrap(), Some(state.clone()));

    let advanced = state.with_position(9);
    store.persist(&id, &advanced).await.unwrap();
    assert_eq!(store.load(&id).await.unwrap(), Some(advanced));
}
