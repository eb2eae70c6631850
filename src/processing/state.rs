//! Stream processor progress state.
//!
//! State values are immutable: every transition builds a new value which is
//! persisted before the worker adopts it, so the durable record is always
//! "the" current position and a crash between processing and persisting
//! redelivers at most one event.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn saturating_add(now: DateTime<Utc>, d: ChronoDuration) -> DateTime<Utc> {
    now.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Identifies the unit of independent progress tracking: one registered
/// processor reading one stream for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamProcessorId {
    /// Tenant the processor runs for.
    pub tenant: Uuid,
    /// Identifier of the registered event processor.
    pub processor: String,
    /// Source stream being read.
    pub stream: String,
}

impl StreamProcessorId {
    pub fn new(tenant: Uuid, processor: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            tenant,
            processor: processor.into(),
            stream: stream.into(),
        }
    }
}

impl std::fmt::Display for StreamProcessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.processor, self.stream)
    }
}

/// Retry state for one failing partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingPartitionState {
    /// Position of the first unprocessed event in this partition.
    pub position: u64,
    /// Earliest time a retry may occur; `None` means never automatically
    /// (permanent failure awaiting operator action).
    pub retry_time: Option<DateTime<Utc>>,
    /// Last recorded failure description.
    pub reason: String,
    /// Number of processing attempts made so far.
    pub processing_attempts: u32,
    /// When the partition last failed.
    pub last_failed: DateTime<Utc>,
}

impl FailingPartitionState {
    /// Whether a retry is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.retry_time {
            Some(t) => t <= now,
            None => false,
        }
    }
}

/// Durable progress of one stream processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamProcessorState {
    /// Next unread position on the main cursor.
    pub position: u64,
    /// Partitions currently being retried out of band, keyed by partition.
    ///
    /// BTreeMap so catch-up iterates in a stable order.
    pub failing_partitions: BTreeMap<String, FailingPartitionState>,
    /// When an event was last processed successfully.
    pub last_successfully_processed: DateTime<Utc>,
}

impl StreamProcessorState {
    /// Initial state for a processor that has never run.
    pub fn initial() -> Self {
        Self {
            position: 0,
            failing_partitions: BTreeMap::new(),
            last_successfully_processed: Utc::now(),
        }
    }

    /// New state with the main cursor advanced past `position`.
    pub fn with_position(&self, position: u64) -> Self {
        let mut next = self.clone();
        next.position = position;
        next
    }

    /// New state with the cursor advanced and the success timestamp touched.
    pub fn with_successful_processing(&self, position: u64, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.position = position;
        next.last_successfully_processed = now;
        next
    }

    /// New state recording a failure for `partition` at `position`.
    ///
    /// First failure creates the entry with one attempt; subsequent
    /// failures keep the recorded position (the earliest unprocessed
    /// event) and increment the attempt counter.
    pub fn with_failing_partition(
        &self,
        partition: &str,
        position: u64,
        retry_after: Option<ChronoDuration>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        let entry = next.failing_partitions.get(partition);
        let (position, attempts) = match entry {
            Some(existing) => (existing.position, existing.processing_attempts + 1),
            None => (position, 1),
        };
        next.failing_partitions.insert(
            partition.to_string(),
            FailingPartitionState {
                position,
                retry_time: retry_after.map(|d| saturating_add(now, d)),
                reason: reason.into(),
                processing_attempts: attempts,
                last_failed: now,
            },
        );
        next
    }

    /// New state with `partition`'s tracked position advanced during
    /// catch-up, keeping its attempt history.
    pub fn with_partition_position(&self, partition: &str, position: u64) -> Self {
        let mut next = self.clone();
        if let Some(entry) = next.failing_partitions.get_mut(partition) {
            entry.position = position;
        }
        next
    }

    /// New state recording a renewed failure during catch-up.
    pub fn with_partition_retry(
        &self,
        partition: &str,
        retry_after: Option<ChronoDuration>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        if let Some(entry) = next.failing_partitions.get_mut(partition) {
            entry.retry_time = retry_after.map(|d| saturating_add(now, d));
            entry.reason = reason.into();
            entry.processing_attempts += 1;
            entry.last_failed = now;
        }
        next
    }

    /// New state with `partition` removed from the failing set (caught up).
    pub fn without_partition(&self, partition: &str) -> Self {
        let mut next = self.clone();
        next.failing_partitions.remove(partition);
        next
    }

    /// Whether `partition` is currently failing.
    pub fn is_partition_failing(&self, partition: &str) -> bool {
        self.failing_partitions.contains_key(partition)
    }
}
