//! Event log and stream fetching interfaces.

use async_trait::async_trait;
use uuid::Uuid;

use crate::events::{Commit, CommittedEvent, ExecutionContext, StreamEvent};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Transient capacity or availability problem. The whole operation is
    /// safe to retry; nothing was committed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// An aggregate's stored version did not match the expected version.
    #[error(
        "Version conflict for {event_source}/{root_type}: expected {expected}, stored {stored}"
    )]
    VersionConflict {
        event_source: String,
        root_type: Uuid,
        expected: u64,
        stored: u64,
    },

    /// A sequence number or stream position was already occupied.
    #[error("Sequence conflict at position {position}")]
    SequenceConflict { position: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Storage error: {0}")]
    Other(String),
}

/// Interface for the durable, append-only event log.
///
/// Implementations must provide multi-record atomic commits: the append,
/// the watermark bump, and every aggregate version update happen in one
/// transaction or not at all.
///
/// Implementations:
/// - `SqliteEventLog`: SQLite storage
/// - `MemoryEventLog`: in-memory storage for tests and standalone use
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Atomically append a commit to the log.
    ///
    /// Assigns consecutive sequence numbers to every event, advances the
    /// event-log watermark, and updates each aggregate group's version
    /// counter conditioned on its expected version. Returns the committed
    /// events in append order.
    ///
    /// Callers must check [`Commit::is_empty`] first; an empty commit is a
    /// caller-side no-op and must not reach the store.
    async fn persist_commit(
        &self,
        context: &ExecutionContext,
        commit: Commit,
    ) -> Result<Vec<CommittedEvent>>;

    /// Next free position for a stream (the watermark).
    ///
    /// Bootstraps the watermark from the stream's last physical entry when
    /// the stream has data but no watermark record yet.
    async fn next_position(&self, tenant: Uuid, stream: &str) -> Result<u64>;

    /// Current version of an aggregate root, if any events were committed.
    async fn aggregate_version(
        &self,
        tenant: Uuid,
        event_source: &str,
        root_type: Uuid,
    ) -> Result<Option<u64>>;

    /// All committed events for an aggregate root in version order.
    async fn fetch_for_aggregate(
        &self,
        tenant: Uuid,
        event_source: &str,
        root_type: Uuid,
    ) -> Result<Vec<CommittedEvent>>;

    /// Materialize events into a derived stream, assigning positions from
    /// the stream's watermark and advancing it in the same transaction.
    ///
    /// `events` pairs each committed event with its partition in the
    /// derived stream. Returns the positions assigned.
    async fn append_to_stream(
        &self,
        tenant: Uuid,
        stream: &str,
        events: Vec<(String, CommittedEvent)>,
    ) -> Result<Vec<u64>>;
}

/// Read-only interface for positioned stream reads.
///
/// `None` results distinguish "not present yet" from hard errors: an
/// absent event or partition is an expected state while a stream catches
/// up, not a failure.
#[async_trait]
pub trait EventFetcher: Send + Sync {
    /// The event at exactly `position` in `stream`, or `None` if the
    /// stream has not reached that position yet.
    async fn fetch(
        &self,
        tenant: Uuid,
        stream: &str,
        position: u64,
    ) -> Result<Option<StreamEvent>>;

    /// First position at or after `from` belonging to `partition`, or
    /// `None` when the partition has no further events yet.
    async fn find_next(
        &self,
        tenant: Uuid,
        stream: &str,
        partition: &str,
        from: u64,
    ) -> Result<Option<u64>>;
}

impl StorageError {
    /// Whether the whole operation is safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        // SQLITE_BUSY and pool exhaustion are capacity problems: the
        // transaction was aborted and the operation may be retried.
        match &e {
            sqlx::Error::PoolTimedOut => StorageError::Unavailable(e.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("5") => {
                StorageError::Unavailable(e.to_string())
            }
            _ => StorageError::Database(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_retryable() {
        assert!(StorageError::Unavailable("busy".to_string()).is_retryable());
        assert!(!StorageError::SequenceConflict { position: 3 }.is_retryable());
        assert!(!StorageError::VersionConflict {
            event_source: "E1".to_string(),
            root_type: Uuid::nil(),
            expected: 2,
            stored: 4,
        }
        .is_retryable());
    }
}
