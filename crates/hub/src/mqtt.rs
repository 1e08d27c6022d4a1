use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use tracing::{debug, error, warn};

use crate::device::{ingestion_timestamp, parse_timestamp, AlarmEvent, UNKNOWN_DEVICE};
use crate::error::DecodeError;
use crate::state::SharedState;
use crate::store::DeviceStore;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// 0/1 flag as sent by the trucks; `true`/`false` is accepted too.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub(crate) enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    fn as_bool(self) -> bool {
        match self {
            Flag::Bool(b) => b,
            Flag::Int(n) => n != 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct AlarmMsg {
    /// Only a string is an identity; anything else is ignored.
    #[serde(default)]
    pub(crate) device_id: Option<Value>,
    #[serde(default)]
    pub(crate) alarm: Option<Flag>,
    #[serde(default)]
    pub(crate) driver_present: Option<Flag>,
    #[serde(default)]
    pub(crate) outer_intrusion: Option<Flag>,
    #[serde(default)]
    pub(crate) timestamp: Option<String>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract device_id from "factory/forklift/<device_id>/alarm".
pub(crate) fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4
        && parts[0] == "factory"
        && parts[1] == "forklift"
        && parts[3] == "alarm"
        && !parts[2].trim().is_empty()
    {
        Some(parts[2])
    } else {
        None
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Turn one raw publish into an [`AlarmEvent`].
///
/// Device identity prefers the topic segment, then the payload's
/// `device_id`, then [`UNKNOWN_DEVICE`]. A missing `alarm` means not
/// alarming; a missing `timestamp` means `now`.
pub(crate) fn decode(topic: &str, payload: &[u8], now: OffsetDateTime) -> Result<AlarmEvent, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject(json_kind(&value)));
    }

    let field_err = |field: &'static str| {
        let raw = value.get(field).map(|v| v.to_string()).unwrap_or_default();
        DecodeError::Field { field, value: raw }
    };

    let msg: AlarmMsg = match serde_json::from_value(value.clone()) {
        Ok(m) => m,
        Err(_) => {
            // Point at the offending field for the log line.
            let bad = ["alarm", "driver_present", "outer_intrusion", "timestamp"]
                .into_iter()
                .find(|f| match (value.get(*f), *f) {
                    (None | Some(Value::Null), _) => false,
                    (Some(v), "timestamp") => !v.is_string(),
                    (Some(v), _) => !(v.is_boolean() || v.is_i64() || v.is_u64()),
                })
                .unwrap_or("payload");
            return Err(field_err(bad));
        }
    };

    let device_id = extract_device_id(topic)
        .map(str::to_string)
        .or_else(|| match msg.device_id {
            Some(Value::String(d)) if !d.trim().is_empty() => Some(d),
            _ => None,
        })
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());

    let timestamp = match msg.timestamp.as_deref() {
        Some(s) => parse_timestamp(s).ok_or_else(|| DecodeError::Timestamp(s.to_string()))?,
        None => ingestion_timestamp(now),
    };

    Ok(AlarmEvent {
        device_id,
        alarm: msg.alarm.map(Flag::as_bool).unwrap_or(false),
        timestamp,
        driver_present: msg.driver_present.map(Flag::as_bool),
        outer_intrusion: msg.outer_intrusion.map(Flag::as_bool),
    })
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Decode one broker message and feed it to the store. Bad messages are
/// dropped and store failures recorded; nothing here ends the receive loop.
pub(crate) async fn handle_publish(
    store: &DeviceStore,
    shared: &SharedState,
    topic: &str,
    payload: &[u8],
    now: OffsetDateTime,
) {
    let event = match decode(topic, payload, now) {
        Ok(ev) => ev,
        Err(e) => {
            warn!(topic, "dropping message: {e}");
            shared
                .write()
                .await
                .record_dropped(format!("{topic}: {e}"));
            return;
        }
    };

    match store.ingest(&event).await {
        Ok(state) => {
            debug!(
                device = %state.device_id,
                alarm = state.alarm_active,
                error_count = state.error_count,
                "ingested"
            );
            shared.write().await.record_ingested();
        }
        Err(e) => {
            error!(device = %event.device_id, "ingest failed: {e}");
            shared
                .write()
                .await
                .record_error(format!("ingest failed for {}: {e}", event.device_id));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
