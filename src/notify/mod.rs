//! In-process wake-up hub for stream workers.
//!
//! The commit writer raises a signal after appending to a stream; workers
//! waiting for new positions subscribe per (tenant, stream). Delivery is
//! best effort over tokio broadcast channels: a missed or lagged signal is
//! recovered by the workers' bounded poll fallback, never treated as an
//! error.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Default capacity for each per-stream broadcast channel.
const CHANNEL_CAPACITY: usize = 1024;

/// Registry of per-(tenant, stream) wake-up channels.
pub struct StreamNotifier {
    channels: Mutex<HashMap<(Uuid, String), broadcast::Sender<()>>>,
    capacity: usize,
}

impl Default for StreamNotifier {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl StreamNotifier {
    /// Create a notifier whose channels hold up to `capacity` pending signals.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to wake-ups for a stream.
    ///
    /// The receiver yields one `()` per notification; `Lagged` errors mean
    /// signals were dropped, which subscribers treat the same as a signal.
    pub fn subscribe(&self, tenant: Uuid, stream: &str) -> broadcast::Receiver<()> {
        let mut channels = self.channels.lock().expect("notifier mutex poisoned");
        channels
            .entry((tenant, stream.to_string()))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Signal that new positions exist on a stream.
    ///
    /// No-op when nobody is subscribed.
    pub fn notify(&self, tenant: Uuid, stream: &str) {
        let channels = self.channels.lock().expect("notifier mutex poisoned");
        if let Some(sender) = channels.get(&(tenant, stream.to_string())) {
            match sender.send(()) {
                Ok(receivers) => {
                    debug!(%tenant, %stream, receivers, "Notified stream subscribers");
                }
                Err(_) => {
                    // All receivers dropped; the poll fallback covers them.
                    debug!(%tenant, %stream, "No live subscribers for stream");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_without_subscribers() {
        let notifier = StreamNotifier::default();
        // Must not panic or error
        notifier.notify(Uuid::new_v4(), "$event-log");
    }

    #[tokio::test]
    async fn test_subscribe_and_notify() {
        let notifier = StreamNotifier::default();
        let tenant = Uuid::new_v4();

        let mut rx = notifier.subscribe(tenant, "$event-log");
        notifier.notify(tenant, "$event-log");

        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_streams_are_isolated() {
        let notifier = StreamNotifier::default();
        let tenant = Uuid::new_v4();

        let mut rx = notifier.subscribe(tenant, "stream-a");
        notifier.notify(tenant, "stream-b");

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let notifier = StreamNotifier::default();

        let mut rx = notifier.subscribe(Uuid::new_v4(), "$event-log");
        notifier.notify(Uuid::new_v4(), "$event-log");

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_woken() {
        let notifier = StreamNotifier::default();
        let tenant = Uuid::new_v4();

        let mut rx1 = notifier.subscribe(tenant, "$event-log");
        let mut rx2 = notifier.subscribe(tenant, "$event-log");
        notifier.notify(tenant, "$event-log");

        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
    }
}
