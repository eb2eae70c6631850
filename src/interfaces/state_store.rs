//! Processor state persistence interface.

use async_trait::async_trait;

use super::event_log::Result;
use crate::processing::state::{StreamProcessorId, StreamProcessorState};

/// Interface for durable stream processor progress.
///
/// The persisted state is the sole source of truth for resuming after a
/// crash; it is never reconstructed by re-scanning the log. "Does not
/// exist yet" is distinct from "exists with initial value": a processor
/// that has never run has no record at all.
///
/// Implementations:
/// - `SqliteStateStore`: SQLite storage
/// - `MemoryStateStore`: in-memory storage for tests and standalone use
#[async_trait]
pub trait ProcessorStateStore: Send + Sync {
    /// Load the persisted state for a processor, if any.
    async fn load(&self, id: &StreamProcessorId) -> Result<Option<StreamProcessorState>>;

    /// Persist the state for a processor.
    ///
    /// Upserts: creates the record if it doesn't exist, replaces it
    /// wholesale if it does.
    async fn persist(&self, id: &StreamProcessorId, state: &StreamProcessorState) -> Result<()>;
}
