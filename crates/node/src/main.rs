mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FleetSim, Profile};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Wall-clock time in the trucks' `YYYY-MM-DD HH:MM:SS` format (UTC).
fn now_stamp() -> Result<String> {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    Ok(OffsetDateTime::now_utc().format(fmt)?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let devices = sim::parse_devices(
        &env::var("DEVICES").unwrap_or_else(|_| "FORK-001,FORK-002,FORK-003".to_string()),
    );
    let flaky = env::var("FLAKY_DEVICE")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "FORK-003".to_string());
    let flaky = (!flaky.is_empty()).then_some(flaky);
    let publish_every_s: u64 = env_or("PUBLISH_EVERY_S", 5);

    let mut fleet = FleetSim::new(devices, flaky.clone(), Profile::default());

    let client_id = format!("forklift-sim-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, broker.clone(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // We only publish, but the event loop must run to keep the connection up.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("simulator connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(
        broker = %broker,
        port,
        devices = ?fleet.devices(),
        flaky = ?flaky,
        every_s = publish_every_s,
        "simulating forklift fleet"
    );

    loop {
        let stamp = now_stamp()?;
        for report in fleet.round(&stamp) {
            let payload = serde_json::to_vec(&report.payload)?;
            match client
                .publish(&report.topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                Ok(()) => info!(
                    device = %report.payload.device_id,
                    alarm = report.payload.alarm,
                    "published"
                ),
                Err(e) => warn!(topic = %report.topic, "publish error: {e}"),
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(Duration::from_secs(publish_every_s)) => {}
        }
    }

    info!("simulator stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
