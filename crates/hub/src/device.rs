//! Device records and the pure transition applied for every ingested event.
//!
//! All business rules for a single device live in [`apply`]:
//!
//! ```text
//!            event                       event
//!  (absent) ───────▶ online ◀──────────────────────── offline
//!                     │  ▲                              ▲
//!                     │  └─ event (alarm edges counted) │
//!                     └──────── sweep timeout ──────────┘
//! ```
//!
//! Coming back from offline (or first contact) resets `boot_time`; every
//! not-alarming → alarming edge bumps `error_count` exactly once.

use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Identity used when neither the topic nor the payload names a device.
pub const UNKNOWN_DEVICE: &str = "unknown";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One decoded telemetry message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEvent {
    pub device_id: String,
    pub alarm: bool,
    /// As reported by the device, or ingestion wall-clock when absent.
    pub timestamp: PrimitiveDateTime,
    pub driver_present: Option<bool>,
    pub outer_intrusion: Option<bool>,
}

/// Current derived state of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub device_id: String,
    pub alarm_active: bool,
    pub error_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub boot_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,

    // Display-only mirrors of the latest event.
    pub driver_present: bool,
    pub outer_intrusion: bool,
    pub last_timestamp: String,
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Compute the state that results from applying `event` at `now`.
///
/// No I/O; deterministic in its inputs.
pub fn apply(previous: Option<&DeviceState>, event: &AlarmEvent, now: OffsetDateTime) -> DeviceState {
    let driver_present = event.driver_present.unwrap_or(false);
    let outer_intrusion = event.outer_intrusion.unwrap_or(false);
    let last_timestamp = format_timestamp(event.timestamp);

    match previous {
        None => DeviceState {
            device_id: event.device_id.clone(),
            alarm_active: event.alarm,
            error_count: i64::from(event.alarm),
            boot_time: now,
            last_seen: now,
            online: true,
            updated_at: now,
            driver_present,
            outer_intrusion,
            last_timestamp,
        },
        Some(prev) => {
            let came_back = !prev.online;
            let alarm_edge = !prev.alarm_active && event.alarm;

            DeviceState {
                device_id: prev.device_id.clone(),
                alarm_active: event.alarm,
                error_count: prev.error_count + i64::from(alarm_edge),
                boot_time: if came_back { now } else { prev.boot_time },
                last_seen: now,
                online: true,
                updated_at: now,
                driver_present,
                outer_intrusion,
                last_timestamp,
            }
        }
    }
}

/// Whether `next` differs from `previous` in a way a subscriber can see.
///
/// `last_seen`/`updated_at` advance on every event and are not counted;
/// anything else (including first contact) is.
pub fn observably_changed(previous: Option<&DeviceState>, next: &DeviceState) -> bool {
    match previous {
        None => true,
        Some(prev) => {
            prev.online != next.online
                || prev.alarm_active != next.alarm_active
                || prev.error_count != next.error_count
                || prev.boot_time != next.boot_time
                || prev.driver_present != next.driver_present
                || prev.outer_intrusion != next.outer_intrusion
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// `YYYY-MM-DD HH:MM:SS`, lexicographic order == time order.
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Parse a device-reported `YYYY-MM-DD HH:MM:SS` timestamp.
pub fn parse_timestamp(s: &str) -> Option<PrimitiveDateTime> {
    PrimitiveDateTime::parse(s.trim(), TIMESTAMP_FORMAT).ok()
}

pub fn format_timestamp(ts: PrimitiveDateTime) -> String {
    // Only a year outside 0..=9999 can fail here.
    ts.format(TIMESTAMP_FORMAT).unwrap_or_else(|_| ts.to_string())
}

/// Wall-clock "now" as a naive timestamp, for events that carry none.
pub fn ingestion_timestamp(now: OffsetDateTime) -> PrimitiveDateTime {
    PrimitiveDateTime::new(now.date(), now.time())
}

// ===========================================================================
// Tests
// ===========================================================================
