use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::api::{ApiError, SharedState};
use super::stream::StreamEvent;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// `GET /api/sequences/{id}/ws`: push stream over a WebSocket. Unknown
/// sequences are rejected before the upgrade.
pub async fn sequence_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let events = state.stream.subscribe(&id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, events, id)))
}

async fn handle_socket(socket: WebSocket, events: mpsc::Receiver<StreamEvent>, sequence_id: String) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, events).await;
    debug!(sequence_id = %sequence_id, "websocket closed");
}

/// Forward stream events to the client with ping/pong keepalive.
///
/// Ends when the event stream finishes (sequence complete, removed, or
/// service shutdown), when the client goes away, or when no Pong arrives
/// within [`PONG_TIMEOUT`]. Dropping `events` stops the push loop behind it.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut events: mpsc::Receiver<StreamEvent>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        debug!(error = %e, "failed to serialize stream event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
