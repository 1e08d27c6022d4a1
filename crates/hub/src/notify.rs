//! Change notification fan-out.
//!
//! The store and the sweeper are handed a [`ChangeNotifier`] at construction
//! and call it with a fresh [`Snapshot`] after every observable change.
//! Delivery is fire-and-forget: `notify` never waits on a subscriber.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::aggregate::Snapshot;

/// Event name used on the real-time channel.
pub const DEVICE_UPDATE: &str = "device_update";

pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, snapshot: Snapshot);
}

/// Broadcast-channel notifier feeding the WebSocket gateway.
///
/// Receivers that fall behind get `Lagged` and skip to the newest snapshot,
/// which is all a dashboard needs.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Arc<Snapshot>>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ChangeNotifier for BroadcastNotifier {
    fn notify(&self, snapshot: Snapshot) {
        debug!(
            devices = snapshot.stats.total,
            online = snapshot.stats.online,
            subscribers = self.tx.receiver_count(),
            "{DEVICE_UPDATE}"
        );
        // No subscribers is not an error.
        let _ = self.tx.send(Arc::new(snapshot));
    }
}

/// Records every snapshot it is handed. Test double.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub(crate) seen: std::sync::Mutex<Vec<Snapshot>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub(crate) fn last(&self) -> Option<Snapshot> {
        self.seen.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
impl ChangeNotifier for RecordingNotifier {
    fn notify(&self, snapshot: Snapshot) {
        self.seen.lock().unwrap().push(snapshot);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn notify_without_subscribers_does_not_panic() {
        let n = BroadcastNotifier::new(4);
        n.notify(Snapshot::default());
        assert_eq!(n.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives_snapshot() {
        let n = BroadcastNotifier::new(4);
        let mut a = n.subscribe();
        let mut b = n.subscribe();

        n.notify(Snapshot::default());

        assert_eq!(a.recv().await.unwrap().stats.total, 0);
        assert_eq!(b.recv().await.unwrap().stats.total, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let n = BroadcastNotifier::new(2);
        let mut rx = n.subscribe();

        for _ in 0..5 {
            n.notify(Snapshot::default());
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert!(rx.recv().await.is_ok());
    }
}
