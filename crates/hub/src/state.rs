use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::aggregate::Snapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral hub bookkeeping for the status page. Device truth lives in the
/// store; this only remembers what the process itself has been doing.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub ingested: u64,
    pub dropped: u64,
    /// Last snapshot served successfully, used when a fresh read fails.
    pub last_snapshot: Option<Snapshot>,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Offline,
    Dropped,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub ingested: u64,
    pub dropped: u64,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            ingested: 0,
            dropped: 0,
            last_snapshot: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record_ingested(&mut self) {
        self.ingested += 1;
    }

    /// Record a message that was dropped before reaching the store.
    pub fn record_dropped(&mut self, detail: String) {
        self.dropped += 1;
        self.push_event(EventKind::Dropped, detail);
    }

    /// Record devices the sweep just flipped offline.
    pub fn record_offline(&mut self, device_ids: &[String]) {
        self.push_event(
            EventKind::Offline,
            format!("went offline: {}", device_ids.join(", ")),
        );
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn remember_snapshot(&mut self, snapshot: &Snapshot) {
        self.last_snapshot = Some(snapshot.clone());
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            ingested: self.ingested,
            dropped: self.dropped,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
