//! WebSocket handler for real-time push
//!
//! Clients connect to /api/v1/ws and receive JSON messages tagged by
//! `type`: periodic `snapshot`s of every source (status + meter levels),
//! plus `transition` and `alert` messages as they happen.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use streamwatch_core::{AlertUpdate, SourceSnapshot, TransitionEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;

/// Lower bound on the snapshot cadence
const MIN_SNAPSHOT_INTERVAL_MS: u64 = 10;

/// Live view of every source
#[derive(Debug, Clone, Serialize)]
pub struct LiveSnapshot {
    pub at: DateTime<Utc>,
    pub master_mute: bool,
    pub unread_alerts: usize,
    pub sources: Vec<SourceSnapshot>,
}

/// One message pushed to WebSocket clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    Snapshot(LiveSnapshot),
    Transition(TransitionEvent),
    Alert(AlertUpdate),
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

fn live_snapshot(state: &AppState) -> LiveSnapshot {
    let supervisor = &state.supervisor;
    LiveSnapshot {
        at: Utc::now(),
        master_mute: supervisor.globals().master_mute,
        unread_alerts: supervisor.router().unread_count(),
        sources: supervisor.snapshot(),
    }
}

fn to_json(message: &WsMessage) -> Option<String> {
    serde_json::to_string(message)
        .map_err(|e| tracing::warn!("Failed to serialize push message: {}", e))
        .ok()
}

/// Handle an individual WebSocket connection
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Subscribe before the initial snapshot so nothing falls in between
    let mut rx = state.ws_tx.subscribe();

    if let Some(json) = to_json(&WsMessage::Snapshot(live_snapshot(&state))) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "WebSocket client lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::debug!("WebSocket client disconnected");
}

/// Send one message to all connected WebSocket clients
pub fn broadcast(state: &AppState, message: &WsMessage) {
    if state.ws_tx.receiver_count() == 0 {
        return;
    }
    if let Some(json) = to_json(message) {
        let _ = state.ws_tx.send(json);
    }
}

/// Feed WebSocket clients until the supervisor's channels close
///
/// Snapshots go out at the configured cadence, and only while someone is
/// connected. Transitions and alerts are forwarded as they arrive.
pub async fn push_loop(state: AppState) {
    let interval_ms = state
        .supervisor
        .monitor_settings()
        .snapshot_interval_ms
        .max(MIN_SNAPSHOT_INTERVAL_MS);
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut alerts = state.supervisor.router().subscribe();
    let mut transitions = state.supervisor.subscribe_transitions();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if state.ws_tx.receiver_count() > 0 {
                    broadcast(&state, &WsMessage::Snapshot(live_snapshot(&state)));
                }
            }
            update = alerts.recv() => match update {
                Ok(update) => broadcast(&state, &WsMessage::Alert(update)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Push loop lagged behind alert updates");
                }
                Err(RecvError::Closed) => break,
            },
            event = transitions.recv() => match event {
                Ok(event) => broadcast(&state, &WsMessage::Transition(event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Push loop lagged behind transitions");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("Push loop stopped");
}
