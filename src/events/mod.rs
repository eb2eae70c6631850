//! Core event data model.
//!
//! Events are immutable once committed. A [`Commit`] is the unit of
//! atomicity on the write path: either every event in it receives a
//! sequence number and becomes durably visible, or none do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved name of the root event-log stream.
///
/// Positions on this stream are the log-wide sequence numbers themselves,
/// and the partition of each event is its event source.
pub const EVENT_LOG_STREAM: &str = "$event-log";

/// Event type identifier plus schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Type of the event.
    pub id: Uuid,
    /// Schema generation of the type.
    pub generation: u32,
}

impl Artifact {
    pub fn new(id: Uuid, generation: u32) -> Self {
        Self { id, generation }
    }
}

/// Tenant and correlation context threaded through every call.
///
/// The runtime instantiates one full engine per tenant; tenant identity is
/// always an explicit parameter, never ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Tenant the operation executes for.
    pub tenant: Uuid,
    /// Correlation ID linking related operations for tracing.
    pub correlation_id: String,
}

impl ExecutionContext {
    pub fn new(tenant: Uuid, correlation_id: impl Into<String>) -> Self {
        Self {
            tenant,
            correlation_id: correlation_id.into(),
        }
    }
}

/// An event that has not yet been assigned a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    /// Identifier of the entity the event originates from.
    pub event_source: String,
    /// Event type and generation.
    pub artifact: Artifact,
    /// Whether the event may leave the microservice boundary.
    pub public: bool,
    /// Opaque event payload.
    pub content: serde_json::Value,
}

/// Aggregate-root association stamped onto committed aggregate events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMetadata {
    /// Type of the aggregate root that applied the event.
    pub root_type: Uuid,
    /// Version of the aggregate root as of this event.
    pub applied_version: u64,
}

/// An event durably appended to the log.
///
/// Never mutated after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    /// Log-wide, gapless, monotonic sequence number.
    pub sequence: u64,
    /// When the event occurred (commit time).
    pub occurred: DateTime<Utc>,
    /// Identifier of the entity the event originates from.
    pub event_source: String,
    /// Context the event was committed under.
    pub execution_context: ExecutionContext,
    /// Event type and generation.
    pub artifact: Artifact,
    /// Whether the event may leave the microservice boundary.
    pub public: bool,
    /// Opaque event payload.
    pub content: serde_json::Value,
    /// Present when the event was applied through an aggregate root.
    pub aggregate: Option<AggregateMetadata>,
}

/// A group of events applied by one aggregate root, committed together
/// with an optimistic concurrency check against `expected_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEventGroup {
    /// Event source the aggregate root acts on.
    pub event_source: String,
    /// Type of the aggregate root.
    pub root_type: Uuid,
    /// Version the aggregate root was at when the events were applied.
    pub expected_version: u64,
    /// Events in application order.
    pub events: Vec<UncommittedEvent>,
}

/// A batch of events submitted for atomic commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Plain (non-aggregate) events.
    pub events: Vec<UncommittedEvent>,
    /// Aggregate-scoped event groups.
    pub aggregate_groups: Vec<AggregateEventGroup>,
}

impl Commit {
    /// Commit containing only plain events.
    pub fn plain(events: Vec<UncommittedEvent>) -> Self {
        Self {
            events,
            aggregate_groups: Vec::new(),
        }
    }

    /// Commit containing a single aggregate event group.
    pub fn aggregate(group: AggregateEventGroup) -> Self {
        Self {
            events: Vec::new(),
            aggregate_groups: vec![group],
        }
    }

    /// Total number of events across plain events and aggregate groups.
    pub fn event_count(&self) -> usize {
        self.events.len()
            + self
                .aggregate_groups
                .iter()
                .map(|g| g.events.len())
                .sum::<usize>()
    }

    /// True when the commit carries no events at all.
    pub fn is_empty(&self) -> bool {
        self.event_count() == 0
    }
}

/// An event positioned in a specific stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stream the event belongs to.
    pub stream: String,
    /// Position of the event within the stream.
    pub position: u64,
    /// Partition the event belongs to within the stream.
    ///
    /// For the event-log stream this is the event source.
    pub partition: String,
    /// The committed event.
    pub event: CommittedEvent,
}
