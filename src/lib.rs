//! Millrace - durable event log and stream-processing core.
//!
//! Persists immutable, ordered events and drives independent stream
//! processors that walk a stream position-by-position, dispatching each
//! event to a pluggable processor while isolating and retrying failures
//! per logical partition.

pub mod bootstrap;
pub mod config;
pub mod events;
pub mod interfaces;
pub mod log;
pub mod notify;
pub mod processing;
pub mod storage;
