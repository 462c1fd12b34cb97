//! WebSocket transport for the live dispatcher.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::error::AppError;
use crate::live::LiveMessage;
use crate::model::PollKind;

/// Keepalive interval; dead peers are dropped on send failure.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /polls/:token/live`: upgrade and stream poll updates. Either token
/// reaches the same channel.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let agg = state
        .store
        .poll_by_any_token(&token)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;

    let poll_id = agg.poll.id;
    let is_organization = agg.poll.kind == PollKind::Organization;
    Ok(ws.on_upgrade(move |socket| viewer_loop(state, socket, poll_id, is_organization)))
}

async fn viewer_loop(state: AppState, mut socket: WebSocket, poll_id: Uuid, is_organization: bool) {
    let mut subscription = state.live.subscribe(poll_id);

    // Late joiners of signup sheets get the current occupancy immediately.
    if is_organization {
        if let Ok(slots) = state.engine.slot_snapshot(poll_id).await {
            if send_json(&mut socket, &LiveMessage::SlotUpdate { slots })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            received = subscription.receiver.recv() => match received {
                Ok(message) => {
                    if send_json(&mut socket, &message).await.is_err() {
                        break;
                    }
                }
                // Overflow: the oldest messages are gone, fresh ones keep
                // flowing.
                Err(RecvError::Lagged(missed)) => {
                    debug!(poll_id = %poll_id, missed, "viewer lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // pongs and client chatter
                Some(Err(_)) => break,
            },
        }
    }
    debug!(poll_id = %poll_id, "viewer disconnected");
}

async fn send_json(socket: &mut WebSocket, message: &LiveMessage) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(payload)).await
}
