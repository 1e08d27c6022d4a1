//! Authoritative device state plus the alarm log, behind per-device locks.
//!
//! Every read-modify-write of a device row (`upsert`, `mark_offline*`) holds
//! that device's lock stripe for its whole duration. Devices on different
//! stripes proceed in parallel; the lock stripe count bounds memory no
//! matter how large the fleet grows.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::aggregate::{self, Snapshot, Trend};
use crate::db::{truncate_to_millis, AlarmRecord, Db};
use crate::device::{self, AlarmEvent, DeviceState};
use crate::error::StoreResult;
use crate::notify::ChangeNotifier;

const LOCK_STRIPES: usize = 64;

#[derive(Clone)]
pub struct DeviceStore {
    db: Db,
    locks: Arc<[Mutex<()>]>,
    /// Held across snapshot read + notify so pushes leave in read order.
    publish: Arc<Mutex<()>>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl DeviceStore {
    pub fn new(db: Db, notifier: Arc<dyn ChangeNotifier>) -> Self {
        let locks: Vec<Mutex<()>> = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Self {
            db,
            locks: locks.into(),
            publish: Arc::new(Mutex::new(())),
            notifier,
        }
    }

    #[cfg(test)]
    pub fn db(&self) -> &Db {
        &self.db
    }

    async fn lock(&self, device_id: &str) -> MutexGuard<'_, ()> {
        let mut h = DefaultHasher::new();
        device_id.hash(&mut h);
        let stripe = (h.finish() % self.locks.len() as u64) as usize;
        self.locks[stripe].lock().await
    }

    // ----------------------------
    // Mutations
    // ----------------------------

    /// Apply `event` to its device and append it to the log.
    ///
    /// Returns the resulting state and whether it changed observably.
    pub async fn upsert(&self, event: &AlarmEvent) -> StoreResult<(DeviceState, bool)> {
        self.upsert_at(event, OffsetDateTime::now_utc()).await
    }

    pub async fn upsert_at(&self, event: &AlarmEvent, now: OffsetDateTime) -> StoreResult<(DeviceState, bool)> {
        let now = truncate_to_millis(now);
        let _guard = self.lock(&event.device_id).await;

        let previous = self.db.get_device(&event.device_id).await?;
        let next = device::apply(previous.as_ref(), event, now);
        self.db.save_device_with_event(&next, event).await?;

        let changed = device::observably_changed(previous.as_ref(), &next);
        Ok((next, changed))
    }

    /// Ingestion path: upsert, then notify subscribers if anything they can
    /// see changed. A failed snapshot read after a successful write is
    /// logged; the write stands.
    pub async fn ingest(&self, event: &AlarmEvent) -> StoreResult<DeviceState> {
        let (state, changed) = self.upsert(event).await?;
        debug!(
            device = %state.device_id,
            alarm = state.alarm_active,
            errors = state.error_count,
            changed,
            "event applied"
        );
        if changed {
            if let Err(e) = self.publish_snapshot().await {
                warn!(device = %state.device_id, "snapshot after upsert failed: {e}");
            }
        }
        Ok(state)
    }

    /// Read the current snapshot and hand it to the notifier.
    ///
    /// Publishers are serialized from read to notify, so the last snapshot
    /// delivered is never older than one delivered before it.
    pub async fn publish_snapshot(&self) -> StoreResult<()> {
        let _guard = self.publish.lock().await;
        let snap = self.snapshot().await?;
        self.notifier.notify(snap);
        Ok(())
    }

    /// Set `online=false` if currently true. Returns whether it flipped.
    ///
    /// The sweep uses [`mark_offline_if_stale`](Self::mark_offline_if_stale);
    /// this unconditional form is for callers that already know.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn mark_offline(&self, device_id: &str) -> StoreResult<bool> {
        let _guard = self.lock(device_id).await;
        self.db
            .set_offline(device_id, truncate_to_millis(OffsetDateTime::now_utc()), None)
            .await
    }

    /// Sweep variant of [`mark_offline`](Self::mark_offline): re-checks
    /// staleness under the device lock, so an event that landed after the
    /// sweep's snapshot keeps the device online.
    pub async fn mark_offline_if_stale(
        &self,
        device_id: &str,
        now: OffsetDateTime,
        threshold: Duration,
    ) -> StoreResult<bool> {
        let now = truncate_to_millis(now);
        let _guard = self.lock(device_id).await;
        self.db.set_offline(device_id, now, Some(now - threshold)).await
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn list_all(&self) -> StoreResult<Vec<DeviceState>> {
        self.db.load_devices().await
    }

    pub async fn list_online(&self) -> StoreResult<Vec<DeviceState>> {
        self.db.load_online_devices().await
    }

    #[cfg(test)]
    pub async fn get(&self, device_id: &str) -> StoreResult<Option<DeviceState>> {
        self.db.get_device(device_id).await
    }

    pub async fn snapshot(&self) -> StoreResult<Snapshot> {
        Ok(Snapshot::new(self.list_all().await?))
    }

    /// Newest `limit` log rows for a device, newest first.
    pub async fn history(&self, device_id: &str, limit: u32) -> StoreResult<Vec<AlarmRecord>> {
        self.db.recent_alarms(device_id, i64::from(limit)).await
    }

    /// Minute buckets over the newest `limit` log rows for a device.
    pub async fn trend(&self, device_id: &str, limit: u32) -> StoreResult<Trend> {
        let window = self.db.recent_alarms(device_id, i64::from(limit)).await?;
        Ok(aggregate::trend(&window))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
