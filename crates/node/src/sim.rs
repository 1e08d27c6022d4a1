//! Fleet simulator for local development.
//!
//! Each round produces one alarm report per truck. One truck can be marked
//! flaky: it skips a share of rounds so the hub's offline sweep has
//! something to catch.

use serde::Serialize;

/// Chances, per report, that a flag is raised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    pub alarm: f64,
    pub driver_present: f64,
    pub outer_intrusion: f64,
    /// Chance the flaky truck stays silent for a round.
    pub skip: f64,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            alarm: 0.2,
            driver_present: 0.8,
            outer_intrusion: 0.1,
            skip: 0.3,
        }
    }
}

/// Wire payload, flags as 0/1 like the real trucks send them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmPayload {
    pub device_id: String,
    pub alarm: u8,
    pub driver_present: u8,
    pub outer_intrusion: u8,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub topic: String,
    pub payload: AlarmPayload,
}

pub fn topic_for(device_id: &str) -> String {
    format!("factory/forklift/{device_id}/alarm")
}

pub struct FleetSim {
    devices: Vec<String>,
    flaky: Option<String>,
    profile: Profile,
    rng: fastrand::Rng,
}

impl FleetSim {
    pub fn new(devices: Vec<String>, flaky: Option<String>, profile: Profile) -> Self {
        Self::with_rng(devices, flaky, profile, fastrand::Rng::new())
    }

    pub fn with_rng(
        devices: Vec<String>,
        flaky: Option<String>,
        profile: Profile,
        rng: fastrand::Rng,
    ) -> Self {
        Self {
            devices,
            flaky,
            profile,
            rng,
        }
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    /// One report per truck, stamped `timestamp`, minus a flaky skip.
    pub fn round(&mut self, timestamp: &str) -> Vec<Report> {
        let mut out = Vec::with_capacity(self.devices.len());
        for id in &self.devices {
            if self.flaky.as_deref() == Some(id.as_str()) && self.rng.f64() < self.profile.skip {
                tracing::info!(device = %id, "simulating silence this round");
                continue;
            }
            out.push(Report {
                topic: topic_for(id),
                payload: AlarmPayload {
                    device_id: id.clone(),
                    alarm: flag(&mut self.rng, self.profile.alarm),
                    driver_present: flag(&mut self.rng, self.profile.driver_present),
                    outer_intrusion: flag(&mut self.rng, self.profile.outer_intrusion),
                    timestamp: timestamp.to_string(),
                },
            });
        }
        out
    }
}

fn flag(rng: &mut fastrand::Rng, p: f64) -> u8 {
    u8::from(rng.f64() < p)
}

/// Split a comma-separated device list, dropping blanks.
pub fn parse_devices(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
