//! Stream processing engine.
//!
//! One independent worker per [`StreamProcessorId`]: a cursor walking one
//! stream in position order, dispatching each event to a registered
//! [`EventProcessor`](crate::interfaces::EventProcessor) and durably
//! persisting progress after every step. Partitioned workers additionally
//! isolate failures per partition and retry them out of band.

pub mod failing_partitions;
pub mod partitioned;
pub mod processor;
pub mod retry;
pub mod state;


pub use partitioned::PartitionedStreamProcessor;
pub use processor::StreamProcessor;
pub use retry::RetryPolicy;
pub use state::{FailingPartitionState, StreamProcessorId, StreamProcessorState};

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::interfaces::StorageError;

/// Errors that stop a stream processor worker.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A fetched event's partition disagrees with the partition being
    /// processed. Contract violation; not retried automatically.
    #[error(
        "Partition mismatch at position {position}: expected '{expected}', event has '{actual}'"
    )]
    PartitionMismatch {
        expected: String,
        actual: String,
        position: u64,
    },
}

/// Result type for processing operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Outcome of a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    /// New data was signalled or the poll interval elapsed; re-check.
    Retry,
    /// The worker was cancelled.
    Cancelled,
}

/// Suspend until a wake-up signal, the poll interval, or cancellation.
///
/// A lagged broadcast receiver counts as a wake-up: dropped signals only
/// mean "something happened", which the re-fetch resolves.
pub(crate) async fn wait_for_wakeup(
    wakeup: &mut broadcast::Receiver<()>,
    cancel: &mut watch::Receiver<bool>,
    poll_interval: Duration,
) -> Wait {
    tokio::select! {
        result = wakeup.recv() => match result {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Wait::Retry,
            Err(broadcast::error::RecvError::Closed) => {
                tokio::time::sleep(poll_interval).await;
                Wait::Retry
            }
        },
        _ = tokio::time::sleep(poll_interval) => Wait::Retry,
        changed = cancel.changed() => match changed {
            Ok(()) if !*cancel.borrow() => Wait::Retry,
            _ => Wait::Cancelled,
        },
    }
}

/// Sleep that observes cancellation.
pub(crate) async fn cancellable_sleep(
    cancel: &mut watch::Receiver<bool>,
    duration: Duration,
) -> Wait {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Wait::Retry,
        changed = cancel.changed() => match changed {
            Ok(()) if !*cancel.borrow() => Wait::Retry,
            _ => Wait::Cancelled,
        },
    }
}

/// True when cancellation has been signalled.
pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Handle to a running stream processor worker.
pub struct WorkerHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Signal the worker to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the worker to finish.
    pub async fn join(self) -> Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(ProcessingError::Storage(StorageError::Other(format!(
                "Worker task panicked: {e}"
            )))),
        }
    }
}

/// Handles for a group of workers stopped and awaited together.
///
/// One engine typically runs one worker per registered processor per
/// tenant; this collects their handles for shutdown.
#[derive(Default)]
pub struct ProcessorSet {
    workers: Vec<WorkerHandle>,
}

impl ProcessorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn an unpartitioned worker into the set.
    pub fn spawn(&mut self, processor: StreamProcessor) {
        self.workers.push(spawn(processor));
    }

    /// Spawn a partitioned worker into the set.
    pub fn spawn_partitioned(&mut self, processor: PartitionedStreamProcessor) {
        self.workers.push(spawn_partitioned(processor));
    }

    /// Signal every worker to stop.
    pub fn stop_all(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Wait for every worker to finish.
    ///
    /// All workers are awaited even when one fails; the first error is
    /// returned.
    pub async fn join_all(self) -> Result<()> {
        let mut first_error = None;
        for worker in self.workers {
            if let Err(e) = worker.join().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Spawn an unpartitioned stream processor worker.
pub fn spawn(processor: StreamProcessor) -> WorkerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let join = tokio::spawn(async move { processor.run(cancel_rx).await });
    WorkerHandle {
        cancel: cancel_tx,
        join,
    }
}

/// Spawn a partitioned stream processor worker.
pub fn spawn_partitioned(processor: PartitionedStreamProcessor) -> WorkerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let join = tokio::spawn(async move { processor.run(cancel_rx).await });
    WorkerHandle {
        cancel: cancel_tx,
        join,
    }
}
