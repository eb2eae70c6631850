//! Unpartitioned stream processor loop.
//!
//! Walks a single stream in position order. Failures do not skip ahead:
//! a retryable result keeps the cursor pinned and retries the same event
//! in place; a permanent failure halts the worker until an operator
//! resolves the blocking event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::events::{ExecutionContext, StreamEvent};
use crate::interfaces::{
    EventFetcher, EventProcessor, ProcessingResult, ProcessorStateStore, RetryContext,
};
use crate::notify::StreamNotifier;

use super::retry::RetryPolicy;
use super::state::{StreamProcessorId, StreamProcessorState};
use super::{cancellable_sleep, is_cancelled, wait_for_wakeup, ProcessingError, Result, Wait};

/// A worker processing one stream for one tenant, one event at a time.
pub struct StreamProcessor {
    id: StreamProcessorId,
    fetcher: Arc<dyn EventFetcher>,
    state_store: Arc<dyn ProcessorStateStore>,
    processor: Arc<dyn EventProcessor>,
    notifier: Arc<StreamNotifier>,
    poll_interval: Duration,
    retry_policy: RetryPolicy,
}

impl StreamProcessor {
    pub fn new(
        id: StreamProcessorId,
        fetcher: Arc<dyn EventFetcher>,
        state_store: Arc<dyn ProcessorStateStore>,
        processor: Arc<dyn EventProcessor>,
        notifier: Arc<StreamNotifier>,
    ) -> Self {
        Self {
            id,
            fetcher,
            state_store,
            processor,
            notifier,
            poll_interval: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Load persisted progress, creating and persisting the initial state
    /// on first run.
    pub(crate) async fn load_state(
        id: &StreamProcessorId,
        state_store: &Arc<dyn ProcessorStateStore>,
    ) -> Result<StreamProcessorState> {
        match state_store.load(id).await? {
            Some(state) => Ok(state),
            None => {
                let state = StreamProcessorState::initial();
                state_store.persist(id, &state).await?;
                Ok(state)
            }
        }
    }

    /// Run the processing loop until cancelled or permanently blocked.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let mut state = loop {
            match Self::load_state(&self.id, &self.state_store).await {
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

        info!(id = %self.id, position = state.position, "Stream processor started");

        loop {
            if is_cancelled(&cancel) {
                break;
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

            match self.process_pinned(&event, &mut cancel, &mut state).await {
                Ok(Pinned::Advanced) => {}
                Ok(Pinned::Halted) => {
                    error!(
                        id = %self.id,
                        position = event.position,
                        "Stream processor halted on permanent failure"
                    );
                    break;
                }
                Ok(Pinned::Cancelled) => break,
                // A transient persist failure must not kill the worker; the
                // event will be redelivered on the next pass.
                Err(ProcessingError::Storage(e)) if e.is_retryable() => {
                    warn!(id = %self.id, position = event.position, error = %e, "Store unavailable, backing off");
                    match cancellable_sleep(&mut cancel, self.poll_interval).await {
                        Wait::Retry => continue,
                        Wait::Cancelled => break,
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!(id = %self.id, position = state.position, "Stream processor stopped");
        Ok(())
    }

    /// Dispatch one event, retrying in place until it succeeds, the
    /// failure turns permanent, or the worker is cancelled.
    async fn process_pinned(
        &self,
        event: &StreamEvent,
        cancel: &mut watch::Receiver<bool>,
        state: &mut StreamProcessorState,
    ) -> Result<Pinned> {
        let context = ExecutionContext::new(
            self.id.tenant,
            event.event.execution_context.correlation_id.clone(),
        );
        let mut retry: Option<RetryContext> = None;

        loop {
            let result = match &retry {
                None => self.processor.process(event, &context).await,
                Some(retry_ctx) => {
                    self.processor
                        .process_retry(event, &context, retry_ctx)
                        .await
                }
            };

            let (reason, delay) = match result {
                ProcessingResult::Succeeded => {
                    let next = state
                        .with_successful_processing(event.position + 1, chrono::Utc::now());
                    self.persist(&next).await?;
                    *state = next;
                    debug!(id = %self.id, position = event.position, "Event processed");
                    return Ok(Pinned::Advanced);
                }
                ProcessingResult::Failed { reason, permanent } => {
                    if permanent {
                        return Ok(Pinned::Halted);
                    }
                    let attempts = retry.as_ref().map(|r| r.retry_count).unwrap_or(0) + 1;
                    (reason, self.retry_policy.delay_for_attempt(attempts))
                }
                ProcessingResult::Retry { reason, timeout } => (reason, timeout),
            };

            let retry_count = retry.as_ref().map(|r| r.retry_count).unwrap_or(0) + 1;
            warn!(
                id = %self.id,
                position = event.position,
                attempt = retry_count,
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "Event processing failed, retrying in place"
            );
            retry = Some(RetryContext {
                failure_reason: reason,
                retry_count,
            });

            if cancellable_sleep(cancel, delay).await == Wait::Cancelled {
                return Ok(Pinned::Cancelled);
            }
        }
    }

    async fn persist(&self, state: &StreamProcessorState) -> Result<()> {
        self.state_store.persist(&self.id, state).await?;
        Ok(())
    }
}

enum Pinned {
    Advanced,
    Halted,
    Cancelled,
}
