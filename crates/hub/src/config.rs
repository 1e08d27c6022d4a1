//! Hub configuration: built-in defaults, an optional TOML file, then
//! environment overrides, validated as a whole.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub sweep: SweepConfig,
    pub history: HistoryConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_url: String,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_sec: u64,
    pub offline_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub history_limit: u32,
    pub trend_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            topic: "factory/forklift/+/alarm".into(),
            client_id: "forklift-hub".into(),
            keep_alive_sec: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:alarm.db?mode=rwc".into(),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_sec: 5,
            offline_timeout_sec: 10,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            trend_limit: 20,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // ── MQTT ────────────────────────────────────────────
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if self.mqtt.topic.trim().is_empty() {
            errors.push("mqtt.topic is empty".into());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if self.mqtt.keep_alive_sec == 0 {
            errors.push("mqtt.keep_alive_sec must be positive".into());
        }

        // ── Storage ─────────────────────────────────────────
        if self.storage.db_url.trim().is_empty() {
            errors.push("storage.db_url is empty".into());
        }

        // ── Sweep timing ────────────────────────────────────
        if self.sweep.interval_sec == 0 {
            errors.push("sweep.interval_sec must be positive".into());
        }
        if self.sweep.offline_timeout_sec == 0 {
            errors.push("sweep.offline_timeout_sec must be positive".into());
        }
        // Normal reporting jitter must not look like silence.
        if self.sweep.interval_sec > 0
            && self.sweep.offline_timeout_sec < self.sweep.interval_sec.saturating_mul(2)
        {
            errors.push(format!(
                "sweep.offline_timeout_sec ({}) must be at least twice sweep.interval_sec ({})",
                self.sweep.offline_timeout_sec, self.sweep.interval_sec
            ));
        }

        // ── Query windows ───────────────────────────────────
        if self.history.history_limit == 0 {
            errors.push("history.history_limit must be positive".into());
        }
        if self.history.trend_limit == 0 {
            errors.push("history.trend_limit must be positive".into());
        }

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}"))
        }

        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = parsed("MQTT_PORT", v)?;
        }
        if let Some(v) = lookup("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID") {
            self.mqtt.client_id = v;
        }
        if let Some(v) = lookup("DB_URL") {
            self.storage.db_url = v;
        }
        if let Some(v) = lookup("OFFLINE_CHECK_INTERVAL_SEC") {
            self.sweep.interval_sec = parsed("OFFLINE_CHECK_INTERVAL_SEC", v)?;
        }
        if let Some(v) = lookup("OFFLINE_TIMEOUT_SEC") {
            self.sweep.offline_timeout_sec = parsed("OFFLINE_TIMEOUT_SEC", v)?;
        }
        if let Some(v) = lookup("HISTORY_LIMIT") {
            self.history.history_limit = parsed("HISTORY_LIMIT", v)?;
        }
        if let Some(v) = lookup("TREND_LIMIT") {
            self.history.trend_limit = parsed("TREND_LIMIT", v)?;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.web.port = parsed("WEB_PORT", v)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read the TOML file at `path` if it exists (defaults otherwise), apply
/// environment overrides, and validate.
pub fn load(path: &str) -> Result<Config> {
    load_with(path, |k| std::env::var(k).ok())
}

pub fn load_with<F>(path: &str, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };

    config
        .apply_env(lookup)
        .context("invalid environment override")?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
