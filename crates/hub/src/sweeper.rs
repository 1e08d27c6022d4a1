//! Offline sweeper: periodically flips silent devices offline.
//!
//! Each cycle takes the online devices, flips every one whose `last_seen`
//! is more than `offline_timeout` ago, and, if any flipped, emits one
//! snapshot for the whole cycle. Storage failures are logged and the loop
//! moves on to the next tick; only cancellation ends it.

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::state::SharedState;
use crate::store::DeviceStore;

/// `true` when `now - last_seen` strictly exceeds `threshold`.
pub fn is_stale(last_seen: OffsetDateTime, now: OffsetDateTime, threshold: time::Duration) -> bool {
    now - last_seen > threshold
}

pub struct Sweeper {
    store: DeviceStore,
    shared: SharedState,
    interval: std::time::Duration,
    offline_timeout: time::Duration,
}

impl Sweeper {
    pub fn new(
        store: DeviceStore,
        shared: SharedState,
        interval: std::time::Duration,
        offline_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            shared,
            interval,
            offline_timeout: time::Duration::try_from(offline_timeout)
                .unwrap_or(time::Duration::MAX),
        }
    }

    /// Run until `shutdown` is cancelled. Intended to be `tokio::spawn`-ed
    /// from main. Cancellation is only observed between cycles, so a cycle
    /// that has started always completes.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; give devices one interval to
        // report before judging them.
        ticker.tick().await;

        info!(
            interval_ms = self.interval.as_millis() as u64,
            offline_timeout_sec = self.offline_timeout.whole_seconds(),
            "sweeper started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.cycle(OffsetDateTime::now_utc()).await;
        }

        info!("sweeper stopped");
    }

    /// One sweep at `now`. Returns the ids flipped offline.
    pub async fn cycle(&self, now: OffsetDateTime) -> Vec<String> {
        let online = match self.store.list_online().await {
            Ok(devs) => devs,
            Err(e) => {
                error!("sweep: listing online devices failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("sweep failed: {e}"));
                return Vec::new();
            }
        };

        let mut flipped = Vec::new();
        for dev in online
            .iter()
            .filter(|d| is_stale(d.last_seen, now, self.offline_timeout))
        {
            match self
                .store
                .mark_offline_if_stale(&dev.device_id, now, self.offline_timeout)
                .await
            {
                Ok(true) => {
                    info!(
                        device = %dev.device_id,
                        silent_sec = (now - dev.last_seen).whole_seconds(),
                        "device offline"
                    );
                    flipped.push(dev.device_id.clone());
                }
                // Reported again between the listing and the flip.
                Ok(false) => {}
                Err(e) => {
                    warn!(device = %dev.device_id, "sweep: mark_offline failed: {e}");
                }
            }
        }

        if flipped.is_empty() {
            return flipped;
        }

        self.shared.write().await.record_offline(&flipped);
        if let Err(e) = self.store.publish_snapshot().await {
            error!(flipped = flipped.len(), "sweep: snapshot after flips failed: {e}");
        }
        flipped
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Snapshot;
    use crate::db::memory_db;
    use crate::device::AlarmEvent;
    use crate::notify::{ChangeNotifier, RecordingNotifier};
    use crate::state::HubState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, OnceLock};
    use std::time::Duration as StdDuration;
    use tokio::task::JoinHandle;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-05-01 08:00:00 UTC);

    fn event(device_id: &str, alarm: bool) -> AlarmEvent {
        AlarmEvent {
            device_id: device_id.into(),
            alarm,
            timestamp: datetime!(2024-05-01 08:00:00),
            driver_present: None,
            outer_intrusion: None,
        }
    }

    async fn setup(interval_ms: u64) -> (Sweeper, DeviceStore, Arc<RecordingNotifier>, SharedState) {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = DeviceStore::new(memory_db().await, notifier.clone());
        let shared = HubState::shared();
        let sweeper = Sweeper::new(
            store.clone(),
            shared.clone(),
            StdDuration::from_millis(interval_ms),
            StdDuration::from_secs(10),
        );
        (sweeper, store, notifier, shared)
    }

    // -- is_stale -------------------------------------------------------------

    #[test]
    fn stale_is_strictly_greater() {
        let th = Duration::seconds(10);
        assert!(!is_stale(T0, T0 + Duration::seconds(9), th));
        assert!(!is_stale(T0, T0 + th, th));
        assert!(is_stale(T0, T0 + Duration::seconds(11), th));
    }

    #[test]
    fn future_last_seen_is_not_stale() {
        assert!(!is_stale(T0 + Duration::seconds(5), T0, Duration::seconds(10)));
    }

    // -- cycle ----------------------------------------------------------------

    #[tokio::test]
    async fn idle_eleven_seconds_goes_offline_then_returns() {
        let (sweeper, store, notifier, _) = setup(5_000).await;
        store.upsert_at(&event("FORK-001", false), T0).await.unwrap();

        let flipped = sweeper.cycle(T0 + Duration::seconds(11)).await;
        assert_eq!(flipped, ["FORK-001"]);
        assert!(!store.get("FORK-001").await.unwrap().unwrap().online);
        assert_eq!(notifier.count(), 1);
        assert_eq!(notifier.last().unwrap().stats.online, 0);

        let back = T0 + Duration::seconds(12);
        let (s, _) = store.upsert_at(&event("FORK-001", false), back).await.unwrap();
        assert!(s.online);
        assert_eq!(s.boot_time, back);
    }

    #[tokio::test]
    async fn exactly_at_threshold_stays_online() {
        let (sweeper, store, notifier, _) = setup(5_000).await;
        store.upsert_at(&event("FORK-001", false), T0).await.unwrap();

        assert!(sweeper.cycle(T0 + Duration::seconds(10)).await.is_empty());
        assert!(store.get("FORK-001").await.unwrap().unwrap().online);
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn many_flips_notify_once() {
        let (sweeper, store, notifier, shared) = setup(5_000).await;
        for id in ["FORK-001", "FORK-002", "FORK-003"] {
            store.upsert_at(&event(id, true), T0).await.unwrap();
        }
        store
            .upsert_at(&event("FORK-004", false), T0 + Duration::seconds(8))
            .await
            .unwrap();

        let flipped = sweeper.cycle(T0 + Duration::seconds(15)).await;
        assert_eq!(flipped, ["FORK-001", "FORK-002", "FORK-003"]);
        assert_eq!(notifier.count(), 1);

        let snap = notifier.last().unwrap();
        assert_eq!(snap.stats.total, 4);
        assert_eq!(snap.stats.online, 1);
        // Alarming devices that went offline no longer count as active.
        assert_eq!(snap.stats.alarm_active, 0);

        let st = shared.read().await;
        assert!(st.events.back().unwrap().detail.contains("FORK-002"));
    }

    #[tokio::test]
    async fn offline_devices_are_not_reflipped() {
        let (sweeper, store, notifier, _) = setup(5_000).await;
        store.upsert_at(&event("FORK-001", false), T0).await.unwrap();

        sweeper.cycle(T0 + Duration::seconds(11)).await;
        assert!(sweeper.cycle(T0 + Duration::seconds(60)).await.is_empty());
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn storage_failure_is_logged_not_fatal() {
        let (sweeper, store, notifier, shared) = setup(5_000).await;
        store.upsert_at(&event("FORK-001", false), T0).await.unwrap();
        store.db().close().await;

        assert!(sweeper.cycle(T0 + Duration::seconds(30)).await.is_empty());
        assert_eq!(notifier.count(), 0);
        let st = shared.read().await;
        assert!(st.events.back().unwrap().detail.starts_with("sweep failed"));
    }

    /// On its first snapshot, lets another device's ingest commit before
    /// recording, as if that event arrived mid-publish.
    #[derive(Default)]
    struct InterleavingNotifier {
        store: OnceLock<DeviceStore>,
        fired: AtomicBool,
        ingest: Mutex<Option<JoinHandle<()>>>,
        totals: Mutex<Vec<usize>>,
    }

    impl ChangeNotifier for InterleavingNotifier {
        fn notify(&self, snapshot: Snapshot) {
            if !self.fired.swap(true, Ordering::SeqCst) {
                if let Some(store) = self.store.get().cloned() {
                    let writer = store.clone();
                    let handle = tokio::spawn(async move {
                        writer.ingest(&event("FORK-002", false)).await.unwrap();
                    });
                    tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current().block_on(async {
                            while store.get("FORK-002").await.unwrap().is_none() {
                                tokio::time::sleep(StdDuration::from_millis(5)).await;
                            }
                        })
                    });
                    *self.ingest.lock().unwrap() = Some(handle);
                }
            }
            self.totals.lock().unwrap().push(snapshot.stats.total);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingest_during_sweep_publish_is_delivered_last() {
        let notifier = Arc::new(InterleavingNotifier::default());
        let store = DeviceStore::new(memory_db().await, notifier.clone());
        assert!(notifier.store.set(store.clone()).is_ok());
        store.upsert_at(&event("FORK-001", false), T0).await.unwrap();

        let sweeper = Sweeper::new(
            store.clone(),
            HubState::shared(),
            StdDuration::from_secs(5),
            StdDuration::from_secs(10),
        );
        let flipped = tokio::spawn(async move { sweeper.cycle(T0 + Duration::seconds(11)).await })
            .await
            .unwrap();
        assert_eq!(flipped, ["FORK-001"]);

        let ingest = notifier.ingest.lock().unwrap().take().expect("ingest was started");
        ingest.await.unwrap();

        // Sweep snapshot (1 device) first, then the newer one (2 devices).
        assert_eq!(*notifier.totals.lock().unwrap(), [1, 2]);
        assert_eq!(store.snapshot().await.unwrap().stats.total, 2);
    }

    // -- run loop -------------------------------------------------------------

    #[tokio::test]
    async fn run_flips_stale_device_and_stops_on_cancel() {
        let (sweeper, store, notifier, _) = setup(20).await;
        // Last seen a minute ago by wall clock.
        let long_ago = OffsetDateTime::now_utc() - Duration::minutes(1);
        store.upsert_at(&event("FORK-001", false), long_ago).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(shutdown.clone()));

        tokio::time::sleep(StdDuration::from_millis(150)).await;
        shutdown.cancel();
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();

        assert!(!store.get("FORK-001").await.unwrap().unwrap().online);
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn run_survives_failing_cycles() {
        let (sweeper, store, _, shared) = setup(10).await;
        store.db().close().await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(shutdown.clone()));

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert!(!handle.is_finished());
        shutdown.cancel();
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();

        // Several failed cycles were recorded, the loop kept going.
        assert!(shared.read().await.events.len() >= 2);
    }
}
