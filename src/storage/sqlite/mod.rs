//! SQLite storage backend.

pub mod event_log;
pub mod state_store;

pub use event_log::SqliteEventLog;
pub use state_store::SqliteStateStore;

#[cfg(test)]
mod tests;
