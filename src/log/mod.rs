//! Write path: commit protocol and stream materialization.
//!
//! [`CommitWriter`] fronts the durable log: it short-circuits empty
//! commits, delegates the atomic append to the store, and wakes waiting
//! stream workers after a successful commit. [`StreamWriter`] does the
//! same for derived streams.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{
    AggregateEventGroup, Commit, CommittedEvent, ExecutionContext, UncommittedEvent,
    EVENT_LOG_STREAM,
};
use crate::interfaces::{EventLog, Result, StorageError};
use crate::notify::StreamNotifier;

/// Request shape of the write surface.
///
/// Carries plain uncommitted events and/or exactly one aggregate event
/// group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitRequest {
    pub events: Vec<UncommittedEvent>,
    pub aggregate_group: Option<AggregateEventGroup>,
}

impl From<CommitRequest> for Commit {
    fn from(request: CommitRequest) -> Self {
        Commit {
            events: request.events,
            aggregate_groups: request.aggregate_group.into_iter().collect(),
        }
    }
}

/// Successful response of the write surface: the committed events with
/// their assigned sequence numbers, in commit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub events: Vec<CommittedEvent>,
}

/// Structured failure returned over the write/read surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitFailure {
    pub id: Uuid,
    pub reason: String,
}

impl CommitFailure {
    pub fn from_error(error: &StorageError) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason: error.to_string(),
        }
    }
}

/// Facade over the durable log implementing the commit protocol.
pub struct CommitWriter {
    log: Arc<dyn EventLog>,
    notifier: Arc<StreamNotifier>,
}

impl CommitWriter {
    pub fn new(log: Arc<dyn EventLog>, notifier: Arc<StreamNotifier>) -> Self {
        Self { log, notifier }
    }

    /// Atomically persist a commit.
    ///
    /// An empty commit is a no-op, not an error: no transaction is opened
    /// and nothing changes. On success, workers waiting on the event-log
    /// stream are woken.
    pub async fn persist(
        &self,
        context: &ExecutionContext,
        commit: Commit,
    ) -> Result<CommitResponse> {
        if commit.is_empty() {
            debug!(tenant = %context.tenant, "Empty commit, nothing to persist");
            return Ok(CommitResponse { events: Vec::new() });
        }

        let count = commit.event_count();
        let events = self.log.persist_commit(context, commit).await?;

        info!(
            tenant = %context.tenant,
            correlation_id = %context.correlation_id,
            count,
            first_sequence = events.first().map(|e| e.sequence).unwrap_or_default(),
            "Commit persisted"
        );
        self.notifier.notify(context.tenant, EVENT_LOG_STREAM);

        Ok(CommitResponse { events })
    }

    /// Serve the write surface: persist and map errors to the structured
    /// failure shape.
    pub async fn handle(
        &self,
        context: &ExecutionContext,
        request: CommitRequest,
    ) -> std::result::Result<CommitResponse, CommitFailure> {
        self.persist(context, request.into())
            .await
            .map_err(|e| CommitFailure::from_error(&e))
    }

    /// All committed events for an aggregate root, in version order.
    pub async fn fetch_for_aggregate(
        &self,
        context: &ExecutionContext,
        event_source: &str,
        root_type: Uuid,
    ) -> Result<Vec<CommittedEvent>> {
        self.log
            .fetch_for_aggregate(context.tenant, event_source, root_type)
            .await
    }
}

/// Facade for materializing derived streams.
///
/// Filters (out of scope here) hand their routed events to this writer;
/// it assigns positions from the stream's watermark and wakes the
/// stream's workers.
pub struct StreamWriter {
    log: Arc<dyn EventLog>,
    notifier: Arc<StreamNotifier>,
}

impl StreamWriter {
    pub fn new(log: Arc<dyn EventLog>, notifier: Arc<StreamNotifier>) -> Self {
        Self { log, notifier }
    }

    /// Append events to a derived stream, paired with their partitions.
    pub async fn append(
        &self,
        tenant: Uuid,
        stream: &str,
        events: Vec<(String, CommittedEvent)>,
    ) -> Result<Vec<u64>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let positions = self.log.append_to_stream(tenant, stream, events).await?;

        debug!(
            tenant = %tenant,
            stream,
            count = positions.len(),
            "Stream events materialized"
        );
        self.notifier.notify(tenant, stream);

        Ok(positions)
    }
}
