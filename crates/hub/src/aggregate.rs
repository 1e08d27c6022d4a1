//! Fleet statistics and per-device alarm trend buckets.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::AlarmRecord;
use crate::device::DeviceState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: usize,
    pub online: usize,
    /// Online devices that are currently alarming.
    pub alarm_active: usize,
}

/// Point-in-time view of the fleet; the body of `/api/latest` and of every
/// `device_update` push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub devices: Vec<DeviceState>,
    pub stats: Stats,
}

impl Snapshot {
    pub fn new(devices: Vec<DeviceState>) -> Self {
        let stats = stats(&devices);
        Self { devices, stats }
    }
}

/// Minute buckets with parallel label/count sequences, ascending by time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Trend {
    pub labels: Vec<String>,
    pub counts: Vec<i64>,
}

pub fn stats(devices: &[DeviceState]) -> Stats {
    Stats {
        total: devices.len(),
        online: devices.iter().filter(|d| d.online).count(),
        alarm_active: devices.iter().filter(|d| d.online && d.alarm_active).count(),
    }
}

/// `YYYY-MM-DD HH:MM` for a stored `YYYY-MM-DD HH:MM:SS` timestamp.
fn minute_label(timestamp: &str) -> &str {
    timestamp.get(..16).unwrap_or(timestamp)
}

/// Bucket an already windowed slice of log rows by minute.
///
/// Only minutes with at least one alarm appear in the result.
pub fn trend(window: &[AlarmRecord]) -> Trend {
    let mut buckets: BTreeMap<&str, i64> = BTreeMap::new();
    for r in window {
        *buckets.entry(minute_label(&r.timestamp)).or_insert(0) += i64::from(r.alarm);
    }

    let mut out = Trend::default();
    for (label, count) in buckets.into_iter().filter(|(_, c)| *c > 0) {
        out.labels.push(label.to_string());
        out.counts.push(count);
    }
    out
}

// ===========================================================================
// Tests
// ===========================================================================
