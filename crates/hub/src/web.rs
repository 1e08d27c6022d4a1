use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::Snapshot;
use crate::notify::{BroadcastNotifier, DEVICE_UPDATE};
use crate::state::SharedState;
use crate::store::DeviceStore;

const INDEX_HTML: &str = include_str!("ui/index.html");

#[derive(Clone)]
pub struct AppState {
    pub store: DeviceStore,
    pub updates: Arc<BroadcastNotifier>,
    pub shared: SharedState,
    pub history_limit: u32,
    pub trend_limit: u32,
}

// ---------------------------------------------------------------------------
// JSON bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HistoryResponse {
    device_id: String,
    labels: Vec<String>,
    counts: Vec<i64>,
    raw_history: Vec<RawAlarm>,
}

#[derive(Serialize)]
struct RawAlarm {
    alarm: u8,
    timestamp: String,
}

#[derive(Serialize)]
struct PushFrame<'a> {
    event: &'static str,
    data: &'a Snapshot,
}

fn push_frame(snapshot: &Snapshot) -> serde_json::Result<String> {
    serde_json::to_string(&PushFrame {
        event: DEVICE_UPDATE,
        data: snapshot,
    })
}

fn internal_error(what: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{what} unavailable") })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/latest", get(api_latest))
        .route("/api/status", get(api_status))
        .route("/device/{device_id}/history", get(device_history))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

/// Fresh snapshot, or the last one served if storage is unreadable.
async fn current_snapshot(state: &AppState) -> Option<Snapshot> {
    match state.store.snapshot().await {
        Ok(snap) => {
            state.shared.write().await.remember_snapshot(&snap);
            Some(snap)
        }
        Err(e) => {
            error!("snapshot read failed: {e}");
            let mut st = state.shared.write().await;
            st.record_error(format!("snapshot read failed: {e}"));
            st.last_snapshot.clone()
        }
    }
}

async fn api_latest(State(state): State<AppState>) -> Response {
    match current_snapshot(&state).await {
        Some(snap) => Json(snap).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no snapshot available" })),
        )
            .into_response(),
    }
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn device_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    let trend = match state.store.trend(&device_id, state.trend_limit).await {
        Ok(t) => t,
        Err(e) => {
            error!(device = %device_id, "trend query failed: {e}");
            return internal_error("trend");
        }
    };
    let rows = match state.store.history(&device_id, state.history_limit).await {
        Ok(r) => r,
        Err(e) => {
            error!(device = %device_id, "history query failed: {e}");
            return internal_error("history");
        }
    };

    Json(HistoryResponse {
        device_id,
        labels: trend.labels,
        counts: trend.counts,
        raw_history: rows
            .into_iter()
            .map(|r| RawAlarm {
                alarm: u8::from(r.alarm),
                timestamp: r.timestamp,
            })
            .collect(),
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// Real-time push
// ---------------------------------------------------------------------------

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before reading the initial snapshot so no change in between
    // is missed.
    let mut rx = state.updates.subscribe();
    debug!(subscribers = state.updates.subscriber_count(), "ws client connected");

    if let Some(text) = initial_frame(&state).await {
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Ok(snap) => {
                    if !send_snapshot(&mut socket, &snap).await {
                        break;
                    }
                }
                // Only the newest snapshot matters; drop the backlog.
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "ws client lagged"),
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("ws client disconnected");
}

/// First frame for a new subscriber: the current fleet as `device_update`.
async fn initial_frame(state: &AppState) -> Option<String> {
    let snap = current_snapshot(state).await?;
    match push_frame(&snap) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("ws encode failed: {e}");
            None
        }
    }
}

async fn send_snapshot(socket: &mut WebSocket, snapshot: &Snapshot) -> bool {
    let text = match push_frame(snapshot) {
        Ok(t) => t,
        Err(e) => {
            warn!("ws encode failed: {e}");
            return true;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
