//! Trait seams consumed and provided by the engine.

pub mod event_log;
pub mod processor;
pub mod state_store;

pub use event_log::{EventFetcher, EventLog, Result, StorageError};
pub use processor::{EventProcessor, ProcessingResult, RetryContext};
pub use state_store::ProcessorStateStore;
