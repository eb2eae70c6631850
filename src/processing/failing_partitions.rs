//! Failing-partitions catch-up.
//!
//! Owns the retry state for partitions that previously failed. Each pass
//! walks the failing set in stable order, redelivers due partitions'
//! events from their own tracked position, and removes a partition once
//! it has caught up to the main cursor. A partition's tracked position
//! never passes the main cursor.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::ExecutionContext;
use crate::interfaces::{
    EventFetcher, EventProcessor, ProcessingResult, ProcessorStateStore, RetryContext,
};

use super::partitioned::to_chrono;
use super::retry::RetryPolicy;
use super::state::{StreamProcessorId, StreamProcessorState};
use super::{is_cancelled, ProcessingError, Result};

/// Catch-up machinery for one partitioned stream processor.
pub struct FailingPartitions {
    id: StreamProcessorId,
    fetcher: Arc<dyn EventFetcher>,
    state_store: Arc<dyn ProcessorStateStore>,
    processor: Arc<dyn EventProcessor>,
    retry_policy: RetryPolicy,
}

impl FailingPartitions {
    pub fn new(
        id: StreamProcessorId,
        fetcher: Arc<dyn EventFetcher>,
        state_store: Arc<dyn ProcessorStateStore>,
        processor: Arc<dyn EventProcessor>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            fetcher,
            state_store,
            processor,
            retry_policy,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// One catch-up pass over every due failing partition.
    ///
    /// Each partition is attempted at most once per pass: a renewed
    /// failure reschedules it and moves on to the next partition.
    pub async fn catchup(
        &self,
        mut state: StreamProcessorState,
        cancel: &watch::Receiver<bool>,
    ) -> Result<StreamProcessorState> {
        let partitions: Vec<String> = state.failing_partitions.keys().cloned().collect();

        for partition in partitions {
            if is_cancelled(cancel) {
                return Ok(state);
            }
            let due = state
                .failing_partitions
                .get(&partition)
                .map(|entry| entry.is_due(Utc::now()))
                .unwrap_or(false);
            if !due {
                continue;
            }
            state = self.catchup_partition(state, &partition, cancel).await?;
        }

        Ok(state)
    }

    /// Redeliver one partition's events from its tracked position until it
    /// catches up to the main cursor, runs out of events, or fails again.
    async fn catchup_partition(
        &self,
        mut state: StreamProcessorState,
        partition: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<StreamProcessorState> {
        loop {
            if is_cancelled(cancel) {
                return Ok(state);
            }

            let Some(entry) = state.failing_partitions.get(partition) else {
                return Ok(state);
            };
            let (from, reason, attempts) = (
                entry.position,
                entry.reason.clone(),
                entry.processing_attempts,
            );

            if from >= state.position {
                info!(id = %self.id, partition, "Partition caught up");
                let next = state.without_partition(partition);
                self.state_store.persist(&self.id, &next).await?;
                return Ok(next);
            }

            let position = match self
                .fetcher
                .find_next(self.id.tenant, &self.id.stream, partition, from)
                .await?
            {
                Some(position) if position < state.position => position,
                Some(_) => {
                    // Remaining partition events are at or past the main
                    // cursor; they rejoin normal flow.
                    info!(id = %self.id, partition, "Partition caught up");
                    let next = state.without_partition(partition);
                    self.state_store.persist(&self.id, &next).await?;
                    return Ok(next);
                }
                // No partition event present yet; stop this partition's
                // catch-up for this pass.
                None => return Ok(state),
            };

            let Some(event) = self
                .fetcher
                .fetch(self.id.tenant, &self.id.stream, position)
                .await?
            else {
                return Ok(state);
            };

            if event.partition != partition {
                return Err(ProcessingError::PartitionMismatch {
                    expected: partition.to_string(),
                    actual: event.partition,
                    position,
                });
            }

            let context = ExecutionContext::new(
                self.id.tenant,
                event.event.execution_context.correlation_id.clone(),
            );
            let retry = RetryContext {
                failure_reason: reason,
                retry_count: attempts,
            };

            match self.processor.process_retry(&event, &context, &retry).await {
                ProcessingResult::Succeeded => {
                    debug!(
                        id = %self.id,
                        partition,
                        position,
                        "Catch-up event processed"
                    );
                    let mut next = state.with_partition_position(partition, position + 1);
                    if position + 1 >= next.position {
                        info!(id = %self.id, partition, "Partition caught up");
                        next = next.without_partition(partition);
                    }
                    self.state_store.persist(&self.id, &next).await?;
                    state = next;
                }
                ProcessingResult::Retry {
                    reason,
                    timeout,
                } => {
                    warn!(
                        id = %self.id,
                        partition,
                        position,
                        attempts = attempts + 1,
                        reason = %reason,
                        "Catch-up failed, partition rescheduled"
                    );
                    let next = state.with_partition_retry(
                        partition,
                        Some(to_chrono(timeout)),
                        reason,
                        Utc::now(),
                    );
                    self.state_store.persist(&self.id, &next).await?;
                    return Ok(next);
                }
                ProcessingResult::Failed { reason, permanent } => {
                    let retry_after = if permanent {
                        None
                    } else {
                        Some(to_chrono(self.retry_policy.delay_for_attempt(attempts + 1)))
                    };
                    warn!(
                        id = %self.id,
                        partition,
                        position,
                        attempts = attempts + 1,
                        permanent,
                        reason = %reason,
                        "Catch-up failed, partition rescheduled"
                    );
                    let next =
                        state.with_partition_retry(partition, retry_after, reason, Utc::now());
                    self.state_store.persist(&self.id, &next).await?;
                    return Ok(next);
                }
            }
        }
    }
}
