//! Event processor interface.
//!
//! Filters, projections, and embeddings implement this contract; the
//! stream processing engine only dispatches to it.

use std::time::Duration;

use async_trait::async_trait;

use crate::events::{ExecutionContext, StreamEvent};

/// Outcome of dispatching one event to a processor.
///
/// A closed set of variants rather than error-based control flow; each
/// variant carries exactly what the engine needs to apply it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// The event was handled; the cursor may advance past it.
    Succeeded,
    /// The event could not be handled.
    ///
    /// `permanent: true` means automatic retries are pointless and the
    /// partition (or stream) requires operator intervention. Otherwise the
    /// engine schedules retries on its own backoff.
    Failed { reason: String, permanent: bool },
    /// The event could not be handled right now: retry after `timeout`.
    Retry { reason: String, timeout: Duration },
}

impl ProcessingResult {
    pub fn failed(reason: impl Into<String>, permanent: bool) -> Self {
        ProcessingResult::Failed {
            reason: reason.into(),
            permanent,
        }
    }

    pub fn retry(reason: impl Into<String>, timeout: Duration) -> Self {
        ProcessingResult::Retry {
            reason: reason.into(),
            timeout,
        }
    }
}

/// Context carried into a re-delivery after a prior failure.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Reason recorded for the last failure.
    pub failure_reason: String,
    /// How many processing attempts have already been made.
    pub retry_count: u32,
}

/// Contract implemented by event processors.
///
/// The engine delivers events at least once; implementations must handle
/// redelivery of an already-processed event idempotently. Within a stream,
/// events arrive in increasing position order except for failing-partition
/// catch-up, which redelivers a partition's events out of band but still
/// in partition-local order.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Stable identifier of this processor, part of the progress key.
    fn id(&self) -> &str;

    /// Handle one event.
    async fn process(&self, event: &StreamEvent, context: &ExecutionContext) -> ProcessingResult;

    /// Handle a redelivered event after a prior failure.
    ///
    /// Default forwards to [`process`](EventProcessor::process);
    /// implementations that care about attempt counts override it.
    async fn process_retry(
        &self,
        event: &StreamEvent,
        context: &ExecutionContext,
        _retry: &RetryContext,
    ) -> ProcessingResult {
        self.process(event, context).await
    }
}
