use super::*;
use crate::events::{AggregateEventGroup, Artifact, UncommittedEvent};

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
async fn test_commit_assigns_consecutive_sequences() {
    let log = MemoryEventLog::new();
    let ctx = context();

    let committed = log
        .persist_commit(
            &ctx,
            Commit::plain(vec![
                event("E1", serde_json::json!({"a": 1})),
                event("E1", serde_json::json!({"a": 2})),
            ]),
        )
        .await
        .unwrap();

    assert_eq!(committed.len(), 2);
    assert_eq!(committed[0].sequence, 0);
    assert_eq!(committed[1].sequence, 1);
    assert_eq!(committed[0].event_source, "E1");
    assert_eq!(committed[1].event_source, "E1");
    assert_eq!(committed[0].content, serde_json::json!({"a": 1}));
    assert_eq!(committed[1].content, serde_json::json!({"a": 2}));

    assert_eq!(
        log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_commit_advances_watermark_by_batch_size() {
    let log = MemoryEventLog::new();
    let ctx = context();

    log.persist_commit(&ctx, Commit::plain(vec![event("E1", serde_json::json!({}))]))
        .await
        .unwrap();
    let before = log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap();

    let committed = log
        .persist_commit(
            &ctx,
            Commit::plain(vec![
                event("E2", serde_json::json!({})),
                event("E3", serde_json::json!({})),
                event("E2", serde_json::json!({})),
            ]),
        )
        .await
        .unwrap();

    assert_eq!(committed[0].sequence, before);
    assert_eq!(
        log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap(),
        before + 3
    );
}

#[tokio::test]
async fn test_aggregate_commit_updates_version() {
    let log = MemoryEventLog::new();
    let ctx = context();
    let root_type = Uuid::new_v4();

    let committed = log
        .persist_commit(
            &ctx,
            Commit::aggregate(AggregateEventGroup {
                event_source: "E1".to_string(),
                root_type,
                expected_version: 0,
                events: vec![
                    event("E1", serde_json::json!({"n": 1})),
                    event("E1", serde_json::json!({"n": 2})),
                ],
            }),
        )
        .await
        .unwrap();

    assert_eq!(
        log.aggregate_version(ctx.tenant, "E1", root_type)
            .await
            .unwrap(),
        Some(2)
    );
    assert_eq!(committed[0].aggregate.unwrap().applied_version, 1);
    assert_eq!(committed[1].aggregate.unwrap().applied_version, 2);
}

#[tokio::test]
async fn test_version_conflict_rejected_and_nothing_committed() {
    let log = MemoryEventLog::new();
    let ctx = context();
    let root_type = Uuid::new_v4();

    let group = AggregateEventGroup {
        event_source: "E1".to_string(),
        root_type,
        expected_version: 0,
        events: vec![event("E1", serde_json::json!({}))],
    };
    log.persist_commit(&ctx, Commit::aggregate(group.clone()))
        .await
        .unwrap();

    // Same expected version again: stale, must be rejected.
    let commit = Commit {
        events: vec![event("E9", serde_json::json!({}))],
        aggregate_groups: vec![group],
    };
    let err = log.persist_commit(&ctx, commit).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::VersionConflict {
            expected: 0,
            stored: 1,
            ..
        }
    ));

    // The plain event in the failed commit is not visible either.
    assert_eq!(
        log.next_position(ctx.tenant, EVENT_LOG_STREAM).await.unwrap(),
        1
    );
    assert_eq!(
        log.aggregate_version(ctx.tenant, "E1", root_type)
            .await
            .unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn test_fetch_for_aggregate_in_version_order() {
    let log = MemoryEventLog::new();
    let ctx = context();
    let root_type = Uuid::new_v4();

    for expected in 0..3 {
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

    let events = log
        .fetch_for_aggregate(ctx.tenant, "E1", root_type)
        .await
        .unwrap();
    let versions: Vec<u64> = events
        .iter()
        .map(|e| e.aggregate.unwrap().applied_version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_fetch_event_log_positions() {
    let log = MemoryEventLog::new();
    let ctx = context();

    log.persist_commit(
        &ctx,
        Commit::plain(vec![
            event("E1", serde_json::json!({})),
            event("E2", serde_json::json!({})),
        ]),
    )
    .await
    .unwrap();

    let first = log
        .fetch(ctx.tenant, EVENT_LOG_STREAM, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.position, 0);
    assert_eq!(first.partition, "E1");

    // Position not written yet reads as "not present", not an error.
    assert!(log.fetch(ctx.tenant, EVENT_LOG_STREAM, 2).await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_next_scans_partition() {
    let log = MemoryEventLog::new();
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
        log.find_next(ctx.tenant, EVENT_LOG_STREAM, "E1", 0)
            .await
            .unwrap(),
        Some(0)
    );
    assert_eq!(
        log.find_next(ctx.tenant, EVENT_LOG_STREAM, "E1", 1)
            .await
            .unwrap(),
        Some(2)
    );
    assert_eq!(
        log.find_next(ctx.tenant, EVENT_LOG_STREAM, "E1", 3)
            .await
            .unwrap(),
        None
    );
    assert_eq!(
        log.find_next(ctx.tenant, EVENT_LOG_STREAM, "E3", 0)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_derived_stream_append_and_fetch() {
    let log = MemoryEventLog::new();
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
            "filtered",
            committed
                .iter()
                .map(|e| (e.event_source.clone(), e.clone()))
                .collect(),
        )
        .await
        .unwrap();
    assert_eq!(positions, vec![0, 1]);

    let fetched = log.fetch(ctx.tenant, "filtered", 1).await.unwrap().unwrap();
    assert_eq!(fetched.partition, "E2");
    assert_eq!(fetched.event.sequence, 1);
    assert_eq!(
        log.find_next(ctx.tenant, "filtered", "E1", 0).await.unwrap(),
        Some(0)
    );
    assert_eq!(log.next_position(ctx.tenant, "filtered").await.unwrap(), 2);
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let log = MemoryEventLog::new();
    let ctx_a = context();
    let ctx_b = context();

    log.persist_commit(&ctx_a, Commit::plain(vec![event("E1", serde_json::json!({}))]))
        .await
        .unwrap();

    assert_eq!(
        log.next_position(ctx_b.tenant, EVENT_LOG_STREAM)
            .await
            .unwrap(),
        0
    );
    assert!(log
        .fetch(ctx_b.tenant, EVENT_LOG_STREAM, 0)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unavailable_store_is_retryable() {
    let log = MemoryEventLog::new();
    let ctx = context();

    log.set_unavailable(true).await;
    let err = log
        .persist_commit(&ctx, Commit::plain(vec![event("E1", serde_json::json!({}))]))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // Every operation honors the flag, reads included.
    assert!(log
        .aggregate_version(ctx.tenant, "E1", Uuid::new_v4())
        .await
        .unwrap_err()
        .is_retryable());
    assert!(log
        .fetch_for_aggregate(ctx.tenant, "E1", Uuid::new_v4())
        .await
        .unwrap_err()
        .is_retryable());
    assert!(log
        .next_position(ctx.tenant, EVENT_LOG_STREAM)
        .await
        .unwrap_err()
        .is_retryable());

    log.set_unavailable(false).await;
    log.persist_commit(&ctx, Commit::plain(vec![event("E1", serde_json::json!({}))]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_state_store_roundtrip() {
    let store = MemoryStateStore::new();
    let id = StreamProcessorId::new(Uuid::new_v4(), "projector", EVENT_LOG_STREAM);

    assert!(store.load(&id).await.unwrap().is_none());

    let state = StreamProcessorState::initial().with_position(5);
    store.persist(&id, &state).await.unwrap();
    assert_eq!(store.load(&id).await.unwrap(), Some(state));
}
