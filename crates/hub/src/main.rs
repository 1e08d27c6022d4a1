mod aggregate;
mod config;
mod db;
mod device;
mod error;
mod mqtt;
mod notify;
mod state;
mod store;
mod sweeper;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use notify::BroadcastNotifier;
use state::HubState;
use store::DeviceStore;
use sweeper::Sweeper;

/// Pending snapshots per WebSocket subscriber before it is marked lagged.
const UPDATE_CHANNEL_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "forklift.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.storage.db_url, cfg.storage.busy_timeout()).await?;
    db.migrate().await?;
    info!(
        db_url = %cfg.storage.db_url,
        logged_alarms = db.alarm_count().await?,
        "db ready"
    );

    // ── Store, notifier, shared state ───────────────────────────────
    let updates = Arc::new(BroadcastNotifier::new(UPDATE_CHANNEL_CAPACITY));
    let store = DeviceStore::new(db.clone(), updates.clone());
    let shared = HubState::shared();
    shared.write().await.record_system("hub started".to_string());

    let shutdown = CancellationToken::new();

    // ── Offline sweeper ─────────────────────────────────────────────
    let sweeper = Sweeper::new(
        store.clone(),
        Arc::clone(&shared),
        cfg.sweep.interval(),
        cfg.sweep.offline_timeout(),
    );
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.clone()));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        store: store.clone(),
        updates: Arc::clone(&updates),
        shared: Arc::clone(&shared),
        history_limit: cfg.history.history_limit,
        trend_limit: cfg.history.trend_limit,
    };
    let web_port = cfg.web.port;
    let web_shutdown = shutdown.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port, web_shutdown).await {
            error!("web server error: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, topic = %cfg.mqtt.topic, "connecting to broker");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let polled = tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                mqtt::handle_publish(&store, &shared, &p.topic, &p.payload, OffsetDateTime::now_utc())
                    .await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Subscriptions are not persisted across a clean session;
                // renew them on every (re)connect.
                if let Err(e) = client.subscribe(&cfg.mqtt.topic, QoS::AtLeastOnce).await {
                    error!("mqtt subscribe failed: {e}");
                }
                info!(topic = %cfg.mqtt.topic, "mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(RECONNECT_DELAY).await;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    shutdown.cancel();
    if let Err(e) = client.disconnect().await {
        debug!("mqtt disconnect: {e}");
    }
    if let Err(e) = sweeper_task.await {
        error!("sweeper task failed: {e}");
    }
    if let Err(e) = web_task.await {
        error!("web task failed: {e}");
    }
    db.close().await;
    info!("hub stopped");
    Ok(())
}
