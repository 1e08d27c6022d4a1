use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::device::{format_timestamp, AlarmEvent, DeviceState};
use crate::error::{StoreError, StoreResult};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One row of the append-only alarm log.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AlarmRecord {
    pub id: i64,
    pub device_id: String,
    pub alarm: bool,
    pub timestamp: String, // YYYY-MM-DD HH:MM:SS
    pub driver_present: Option<bool>,
    pub outer_intrusion: Option<bool>,
}

#[derive(Debug, FromRow)]
struct DeviceRow {
    device_id: String,
    alarm_active: bool,
    error_count: i64,
    boot_time: i64,
    last_seen: i64,
    online: bool,
    updated_at: i64,
    driver_present: bool,
    outer_intrusion: bool,
    last_timestamp: String,
}

impl DeviceRow {
    fn into_state(self) -> StoreResult<DeviceState> {
        let instant = |ms: i64, what: &str| {
            from_millis(ms).ok_or_else(|| StoreError::Corrupt {
                device_id: self.device_id.clone(),
                detail: format!("{what} {ms} out of range"),
            })
        };
        let boot_time = instant(self.boot_time, "boot_time")?;
        let last_seen = instant(self.last_seen, "last_seen")?;
        let updated_at = instant(self.updated_at, "updated_at")?;

        Ok(DeviceState {
            device_id: self.device_id,
            alarm_active: self.alarm_active,
            error_count: self.error_count,
            boot_time,
            last_seen,
            online: self.online,
            updated_at,
            driver_present: self.driver_present,
            outer_intrusion: self.outer_intrusion,
            last_timestamp: self.last_timestamp,
        })
    }
}

const DEVICE_COLUMNS: &str = "device_id, alarm_active, error_count, boot_time, last_seen, \
     online, updated_at, driver_present, outer_intrusion, last_timestamp";

pub(crate) fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

/// Drop sub-millisecond precision so values survive a storage round-trip.
pub(crate) fn truncate_to_millis(t: OffsetDateTime) -> OffsetDateTime {
    from_millis(to_millis(t)).unwrap_or(t)
}

impl Db {
    /// db_url examples:
    /// - "sqlite:alarm.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        // Every connection to ":memory:" is its own database, so keep
        // exactly one alive for the life of the pool.
        let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Wait for in-flight queries, then close every connection. Later
    /// queries fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Device state
    // ----------------------------

    pub async fn get_device(&self, device_id: &str) -> StoreResult<Option<DeviceState>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?");
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DeviceRow::into_state).transpose()
    }

    pub async fn load_devices(&self) -> StoreResult<Vec<DeviceState>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY device_id");
        let rows = sqlx::query_as::<_, DeviceRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DeviceRow::into_state).collect()
    }

    pub async fn load_online_devices(&self) -> StoreResult<Vec<DeviceState>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE online = 1 ORDER BY device_id");
        let rows = sqlx::query_as::<_, DeviceRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DeviceRow::into_state).collect()
    }

    /// Persist `state` and append `event` to the log in one transaction.
    ///
    /// The transaction only writes, so SQLite takes the write lock on the
    /// first statement and the busy timeout applies.
    pub async fn save_device_with_event(&self, state: &DeviceState, event: &AlarmEvent) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO devices (
              device_id, alarm_active, error_count, boot_time, last_seen,
              online, updated_at, driver_present, outer_intrusion, last_timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              alarm_active=excluded.alarm_active,
              error_count=excluded.error_count,
              boot_time=excluded.boot_time,
              last_seen=excluded.last_seen,
              online=excluded.online,
              updated_at=excluded.updated_at,
              driver_present=excluded.driver_present,
              outer_intrusion=excluded.outer_intrusion,
              last_timestamp=excluded.last_timestamp
            "#,
        )
        .bind(&state.device_id)
        .bind(state.alarm_active)
        .bind(state.error_count)
        .bind(to_millis(state.boot_time))
        .bind(to_millis(state.last_seen))
        .bind(state.online)
        .bind(to_millis(state.updated_at))
        .bind(state.driver_present)
        .bind(state.outer_intrusion)
        .bind(&state.last_timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO alarms (device_id, alarm, timestamp, driver_present, outer_intrusion)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.device_id)
        .bind(event.alarm)
        .bind(format_timestamp(event.timestamp))
        .bind(event.driver_present)
        .bind(event.outer_intrusion)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Flip `online` to false if it is currently true. With `seen_before`,
    /// only when `last_seen` is still strictly older than that instant.
    /// Returns whether a row changed.
    pub async fn set_offline(
        &self,
        device_id: &str,
        now: OffsetDateTime,
        seen_before: Option<OffsetDateTime>,
    ) -> StoreResult<bool> {
        let cutoff = seen_before.map(to_millis);
        let res = sqlx::query(
            r#"
            UPDATE devices
            SET online = 0, updated_at = ?
            WHERE device_id = ? AND online = 1
              AND (? IS NULL OR last_seen < ?)
            "#,
        )
        .bind(to_millis(now))
        .bind(device_id)
        .bind(cutoff)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Alarm log
    // ----------------------------

    /// Newest `limit` log rows for a device, newest first.
    pub async fn recent_alarms(&self, device_id: &str, limit: i64) -> StoreResult<Vec<AlarmRecord>> {
        let rows = sqlx::query_as::<_, AlarmRecord>(
            r#"
            SELECT id, device_id, alarm, timestamp, driver_present, outer_intrusion
            FROM alarms
            WHERE device_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn alarm_count(&self) -> StoreResult<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alarms")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

/// Fresh migrated in-memory database.
#[cfg(test)]
pub(crate) async fn memory_db() -> Db {
    let db = Db::connect("sqlite::memory:", Duration::from_secs(5)).await.unwrap();
    db.migrate().await.unwrap();
    db
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::apply;
    use time::macros::datetime;

    fn event(device_id: &str, alarm: bool, ts: time::PrimitiveDateTime) -> AlarmEvent {
        AlarmEvent {
            device_id: device_id.into(),
            alarm,
            timestamp: ts,
            driver_present: Some(true),
            outer_intrusion: None,
        }
    }

    #[test]
    fn millis_round_trip_truncates() {
        let t = datetime!(2024-05-01 08:00:00.123456789 UTC);
        let back = from_millis(to_millis(t)).unwrap();
        assert_eq!(back, datetime!(2024-05-01 08:00:00.123 UTC));
        assert_eq!(truncate_to_millis(t), back);
    }

    #[tokio::test]
    async fn save_and_load_device() {
        let db = memory_db().await;
        let now = datetime!(2024-05-01 08:00:00 UTC);
        let ev = event("FORK-001", true, datetime!(2024-05-01 07:59:58));
        let state = apply(None, &ev, now);

        db.save_device_with_event(&state, &ev).await.unwrap();

        let loaded = db.get_device("FORK-001").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(db.alarm_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_unknown_device_is_none() {
        let db = memory_db().await;
        assert!(db.get_device("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_devices_sorted_by_id() {
        let db = memory_db().await;
        let now = datetime!(2024-05-01 08:00:00 UTC);
        for id in ["FORK-003", "FORK-001", "FORK-002"] {
            let ev = event(id, false, datetime!(2024-05-01 08:00:00));
            db.save_device_with_event(&apply(None, &ev, now), &ev).await.unwrap();
        }
        let ids: Vec<String> = db
            .load_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(ids, ["FORK-001", "FORK-002", "FORK-003"]);
    }

    #[tokio::test]
    async fn set_offline_only_flips_online_rows() {
        let db = memory_db().await;
        let now = datetime!(2024-05-01 08:00:00 UTC);
        let ev = event("FORK-001", false, datetime!(2024-05-01 08:00:00));
        db.save_device_with_event(&apply(None, &ev, now), &ev).await.unwrap();

        assert!(db.set_offline("FORK-001", now, None).await.unwrap());
        assert!(!db.set_offline("FORK-001", now, None).await.unwrap());
        assert!(!db.set_offline("missing", now, None).await.unwrap());
        assert!(db.load_online_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_offline_respects_seen_before() {
        let db = memory_db().await;
        let seen = datetime!(2024-05-01 08:00:00 UTC);
        let ev = event("FORK-001", false, datetime!(2024-05-01 08:00:00));
        db.save_device_with_event(&apply(None, &ev, seen), &ev).await.unwrap();

        // last_seen == cutoff is not strictly older.
        assert!(!db.set_offline("FORK-001", seen, Some(seen)).await.unwrap());
        let later = seen + time::Duration::milliseconds(1);
        assert!(db.set_offline("FORK-001", later, Some(later)).await.unwrap());
    }

    #[tokio::test]
    async fn recent_alarms_newest_first_with_limit() {
        let db = memory_db().await;
        let now = datetime!(2024-05-01 08:00:00 UTC);
        let mut prev: Option<DeviceState> = None;
        for sec in 0..5u8 {
            let ts = datetime!(2024-05-01 08:00:00) + time::Duration::seconds(i64::from(sec));
            let ev = event("FORK-001", sec % 2 == 0, ts);
            let next = apply(prev.as_ref(), &ev, now);
            db.save_device_with_event(&next, &ev).await.unwrap();
            prev = Some(next);
        }

        let rows = db.recent_alarms("FORK-001", 3).await.unwrap();
        let stamps: Vec<&str> = rows.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(
            stamps,
            ["2024-05-01 08:00:04", "2024-05-01 08:00:03", "2024-05-01 08:00:02"]
        );
        assert!(rows[0].alarm);
        assert_eq!(rows[0].driver_present, Some(true));
        assert_eq!(rows[0].outer_intrusion, None);
        assert!(db.recent_alarms("FORK-404", 3).await.unwrap().is_empty());
    }
}
