//! Partitioned stream processor loop.
//!
//! Same cursor machinery as the unpartitioned loop, but a failure only
//! sidelines the event's partition: the partition is recorded as failing,
//! the main cursor advances past it, and the failing-partitions catch-up
//! pass redelivers the partition's events out of band until it rejoins
//! normal flow.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::events::{ExecutionContext, StreamEvent};
use crate::interfaces::{
    EventFetcher, EventProcessor, ProcessingResult, ProcessorStateStore,
};
use crate::notify::StreamNotifier;

use super::failing_partitions::FailingPartitions;
use super::processor::StreamProcessor;
use super::retry::RetryPolicy;
use super::state::{StreamProcessorId, StreamProcessorState};
use super::{cancellable_sleep, is_cancelled, wait_for_wakeup, ProcessingError, Result, Wait};

/// A worker processing one partitioned stream for one tenant.
pub struct PartitionedStreamProcessor {
    id: StreamProcessorId,
    fetcher: Arc<dyn EventFetcher>,
    state_store: Arc<dyn ProcessorStateStore>,
    processor: Arc<dyn EventProcessor>,
    notifier: Arc<StreamNotifier>,
    poll_interval: Duration,
    failing: FailingPartitions,
}

impl PartitionedStreamProcessor {
    pub fn new(
        id: StreamProcessorId,
        fetcher: Arc<dyn EventFetcher>,
        state_store: Arc<dyn ProcessorStateStore>,
        processor: Arc<dyn EventProcessor>,
        notifier: Arc<StreamNotifier>,
    ) -> Self {
        let failing = FailingPartitions::new(
            id.clone(),
            fetcher.clone(),
            state_store.clone(),
            processor.clone(),
            RetryPolicy::default(),
        );
        Self {
            id,
            fetcher,
            state_store,
            processor,
            notifier,
            poll_interval: Duration::from_secs(1),
            failing,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.failing = self.failing.with_retry_policy(retry_policy);
        self
    }

    /// Run the processing loop until cancelled.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let mut state = loop {
            match StreamProcessor::load_state(&self.id, &self.state_store).await {
                Ok(state) => break state,
                Err(ProcessingError::Storage(e)) if e.is_retryable() => {
                    warn!(id = %self.id, error = %e, "Store unavailable, backing off");
                    if cancellable_sleep(&mut cancel, self.poll_interval).await == Wait::Cancelled {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        };
        let mut wakeup = self.notifier.subscribe(self.id.tenant, &self.id.stream);

        info!(
            id = %self.id,
            position = state.position,
            failing = state.failing_partitions.len(),
            "Partitioned stream processor started"
        );

        loop {
            if is_cancelled(&cancel) {
                break;
            }

            // Catch-up runs before normal processing whenever any
            // partition is failing.
            if !state.failing_partitions.is_empty() {
                match self.failing.catchup(state.clone(), &cancel).await {
                    Ok(next) => state = next,
                    Err(ProcessingError::Storage(e)) if e.is_retryable() => {
                        warn!(id = %self.id, error = %e, "Store unavailable, backing off");
                        match cancellable_sleep(&mut cancel, self.poll_interval).await {
                            Wait::Retry => continue,
                            Wait::Cancelled => break,
                        }
                    }
                    Err(e) => return Err(e),
                }
                if is_cancelled(&cancel) {
                    break;
                }
            }

            let event = match self
                .fetcher
                .fetch(self.id.tenant, &self.id.stream, state.position)
                .await
            {
                Ok(Some(event)) => event,
                Ok(None) => {
                    match wait_for_wakeup(&mut wakeup, &mut cancel, self.poll_interval).await {
                        Wait::Retry => continue,
                        Wait::Cancelled => break,
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(id = %self.id, error = %e, "Store unavailable, backing off");
                    match cancellable_sleep(&mut cancel, self.poll_interval).await {
                        Wait::Retry => continue,
                        Wait::Cancelled => break,
                    }
                }
                Err(e) => {
                    error!(id = %self.id, position = state.position, error = %e, "Fetch failed");
                    match cancellable_sleep(&mut cancel, self.poll_interval).await {
                        Wait::Retry => continue,
                        Wait::Cancelled => break,
                    }
                }
            };

            // A transient persist failure must not kill the worker; the
            // event is fetched and dispatched again on the next pass.
            match self.process_one(state.clone(), &event).await {
                Ok(next) => state = next,
                Err(ProcessingError::Storage(e)) if e.is_retryable() => {
                    warn!(id = %self.id, position = state.position, error = %e, "Store unavailable, backing off");
                    match cancellable_sleep(&mut cancel, self.poll_interval).await {
                        Wait::Retry => continue,
                        Wait::Cancelled => break,
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!(id = %self.id, position = state.position, "Partitioned stream processor stopped");
        Ok(())
    }

    /// Process the event at the main cursor and advance past it.
    ///
    /// The new state is persisted before it is adopted; the durable record
    /// always reflects "the" current position.
    pub async fn process_one(
        &self,
        state: StreamProcessorState,
        event: &StreamEvent,
    ) -> Result<StreamProcessorState> {
        let now = Utc::now();

        // Events of an already-failing partition are skipped by the main
        // cursor; catch-up owns their delivery from the partition's own
        // position onward.
        if state.is_partition_failing(&event.partition) {
            debug!(
                id = %self.id,
                position = event.position,
                partition = %event.partition,
                "Partition is failing, advancing past event"
            );
            let next = state.with_position(event.position + 1);
            self.state_store.persist(&self.id, &next).await?;
            return Ok(next);
        }

        let context = ExecutionContext::new(
            self.id.tenant,
            event.event.execution_context.correlation_id.clone(),
        );

        let next = match self.processor.process(event, &context).await {
            ProcessingResult::Succeeded => {
                debug!(id = %self.id, position = event.position, "Event processed");
                state.with_successful_processing(event.position + 1, now)
            }
            ProcessingResult::Retry { reason, timeout } => {
                warn!(
                    id = %self.id,
                    position = event.position,
                    partition = %event.partition,
                    reason = %reason,
                    "Event processing failed, partition scheduled for retry"
                );
                state
                    .with_failing_partition(
                        &event.partition,
                        event.position,
                        Some(to_chrono(timeout)),
                        reason,
                        now,
                    )
                    .with_position(event.position + 1)
            }
            ProcessingResult::Failed { reason, permanent } => {
                let retry_after = if permanent {
                    None
                } else {
                    Some(to_chrono(self.failing.retry_policy().delay_for_attempt(1)))
                };
                warn!(
                    id = %self.id,
                    position = event.position,
                    partition = %event.partition,
                    permanent,
                    reason = %reason,
                    "Event processing failed, partition marked failing"
                );
                state
                    .with_failing_partition(&event.partition, event.position, retry_after, reason, now)
                    .with_position(event.position + 1)
            }
        };

        self.state_store.persist(&self.id, &next).await?;
        Ok(next)
    }
}

pub(crate) fn to_chrono(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
