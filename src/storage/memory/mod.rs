//! In-memory storage backend.
//!
//! Backs tests and standalone single-process deployments with the exact
//! trait contracts of the durable backends. Atomicity is trivial here:
//! every validation runs before any mutation under one write lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::{
    AggregateMetadata, Commit, CommittedEvent, ExecutionContext, StreamEvent, EVENT_LOG_STREAM,
};
use crate::interfaces::event_log::{EventFetcher, EventLog, Result, StorageError};
use crate::interfaces::state_store::ProcessorStateStore;
use crate::processing::state::{StreamProcessorId, StreamProcessorState};

#[derive(Default)]
struct TenantLog {
    /// Index is the sequence number.
    events: Vec<CommittedEvent>,
    /// Derived streams; index is the position, entries are (partition, event).
    streams: HashMap<String, Vec<(String, CommittedEvent)>>,
    /// Aggregate versions keyed by (event_source, root_type).
    versions: HashMap<(String, Uuid), u64>,
}

/// In-memory event log.
#[derive(Default)]
pub struct MemoryEventLog {
    tenants: RwLock<HashMap<Uuid, TenantLog>>,
    unavailable: RwLock<bool>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a retryable `Unavailable` error.
    ///
    /// Simulates store capacity exhaustion in tests.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    async fn check_available(&self) -> Result<()> {
        if *self.unavailable.read().await {
            return Err(StorageError::Unavailable("store at capacity".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn persist_commit(
        &self,
        context: &ExecutionContext,
        commit: Commit,
    ) -> Result<Vec<CommittedEvent>> {
        self.check_available().await?;

        let mut tenants = self.tenants.write().await;
        let log = tenants.entry(context.tenant).or_default();

        // Validate every aggregate group before mutating anything.
        for group in &commit.aggregate_groups {
            let key = (group.event_source.clone(), group.root_type);
            let stored = log.versions.get(&key).copied().unwrap_or(0);
            if stored != group.expected_version {
                return Err(StorageError::VersionConflict {
                    event_source: group.event_source.clone(),
                    root_type: group.root_type,
                    expected: group.expected_version,
                    stored,
                });
            }
        }

        let occurred = Utc::now();
        let mut sequence = log.events.len() as u64;
        let mut committed = Vec::with_capacity(commit.event_count());

        for event in commit.events {
            committed.push(CommittedEvent {
                sequence,
                occurred,
                event_source: event.event_source,
                execution_context: context.clone(),
                artifact: event.artifact,
                public: event.public,
                content: event.content,
                aggregate: None,
            });
            sequence += 1;
        }

        for group in commit.aggregate_groups {
            let key = (group.event_source.clone(), group.root_type);
            let next_version = group.expected_version + group.events.len() as u64;

            for (offset, event) in group.events.into_iter().enumerate() {
                committed.push(CommittedEvent {
                    sequence,
                    occurred,
                    event_source: group.event_source.clone(),
                    execution_context: context.clone(),
                    artifact: event.artifact,
                    public: event.public,
                    content: event.content,
                    aggregate: Some(AggregateMetadata {
                        root_type: group.root_type,
                        applied_version: group.expected_version + offset as u64 + 1,
                    }),
                });
                sequence += 1;
            }

            log.versions.insert(key, next_version);
        }

        log.events.extend(committed.iter().cloned());

        Ok(committed)
    }

    async fn next_position(&self, tenant: Uuid, stream: &str) -> Result<u64> {
        self.check_available().await?;

        let tenants = self.tenants.read().await;
        let Some(log) = tenants.get(&tenant) else {
            return Ok(0);
        };

        if stream == EVENT_LOG_STREAM {
            Ok(log.events.len() as u64)
        } else {
            Ok(log.streams.get(stream).map(|s| s.len() as u64).unwrap_or(0))
        }
    }

    async fn aggregate_version(
        &self,
        tenant: Uuid,
        event_source: &str,
        root_type: Uuid,
    ) -> Result<Option<u64>> {
        self.check_available().await?;

        let tenants = self.tenants.read().await;
        Ok(tenants.get(&tenant).and_then(|log| {
            log.versions
                .get(&(event_source.to_string(), root_type))
                .copied()
        }))
    }

    async fn fetch_for_aggregate(
        &self,
        tenant: Uuid,
        event_source: &str,
        root_type: Uuid,
    ) -> Result<Vec<CommittedEvent>> {
        self.check_available().await?;

        let tenants = self.tenants.read().await;
        let Some(log) = tenants.get(&tenant) else {
            return Ok(Vec::new());
        };

        Ok(log
            .events
            .iter()
            .filter(|e| {
                e.event_source == event_source
                    && e.aggregate.map(|a| a.root_type) == Some(root_type)
            })
            .cloned()
            .collect())
    }

    async fn append_to_stream(
        &self,
        tenant: Uuid,
        stream: &str,
        events: Vec<(String, CommittedEvent)>,
    ) -> Result<Vec<u64>> {
        self.check_available().await?;

        let mut tenants = self.tenants.write().await;
        let log = tenants.entry(tenant).or_default();
        let entries = log.streams.entry(stream.to_string()).or_default();

        let base = entries.len() as u64;
        let positions = (base..base + events.len() as u64).collect();
        entries.extend(events);

        Ok(positions)
    }
}

#[async_trait]
impl EventFetcher for MemoryEventLog {
    async fn fetch(
        &self,
        tenant: Uuid,
        stream: &str,
        position: u64,
    ) -> Result<Option<StreamEvent>> {
        self.check_available().await?;

        let tenants = self.tenants.read().await;
        let Some(log) = tenants.get(&tenant) else {
            return Ok(None);
        };

        if stream == EVENT_LOG_STREAM {
            return Ok(log.events.get(position as usize).map(|event| StreamEvent {
                stream: stream.to_string(),
                position,
                partition: event.event_source.clone(),
                event: event.clone(),
            }));
        }

        Ok(log.streams.get(stream).and_then(|entries| {
            entries
                .get(position as usize)
                .map(|(partition, event)| StreamEvent {
                    stream: stream.to_string(),
                    position,
                    partition: partition.clone(),
                    event: event.clone(),
                })
        }))
    }

    async fn find_next(
        &self,
        tenant: Uuid,
        stream: &str,
        partition: &str,
        from: u64,
    ) -> Result<Option<u64>> {
        self.check_available().await?;

        let tenants = self.tenants.read().await;
        let Some(log) = tenants.get(&tenant) else {
            return Ok(None);
        };

        if stream == EVENT_LOG_STREAM {
            return Ok(log
                .events
                .iter()
                .skip(from as usize)
                .position(|e| e.event_source == partition)
                .map(|offset| from + offset as u64));
        }

        Ok(log.streams.get(stream).and_then(|entries| {
            entries
                .iter()
                .skip(from as usize)
                .position(|(p, _)| p == partition)
                .map(|offset| from + offset as u64)
        }))
    }
}

/// In-memory processor state store.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<StreamProcessorId, StreamProcessorState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessorStateStore for MemoryStateStore {
    async fn load(&self, id: &StreamProcessorId) -> Result<Option<StreamProcessorState>> {
        let states = self.states.read().await;
        Ok(states.get(id).cloned())
    }

    async fn persist(&self, id: &StreamProcessorId, state: &StreamProcessorState) -> Result<()> {
        let mut states = self.states.write().await;
        states.insert(id.clone(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests;
