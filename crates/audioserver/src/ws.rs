//! The push side of the progress channel.
//!
//! Every socket gets a server-assigned connection id, announced in the first
//! frame. Clients quote it when submitting jobs; events for those jobs are
//! sent to this socket only.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;

use crate::{
    channel::{ProgressEvent, ProgressHub},
    routes::AppState,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn progress_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

fn encode(event: &ProgressEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(err) => {
            tracing::warn!("failed to encode progress event: {err}");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, hub: ProgressHub) {
    let (connection_id, mut events) = hub.connect();
    let (mut sender, mut receiver) = socket.split();
    tracing::debug!(connection_id = %connection_id, "client connected");

    let hello = ProgressEvent::Connected {
        connection_id: connection_id.clone(),
    };
    if let Some(frame) = encode(&hello) {
        if sender.send(frame).await.is_err() {
            hub.disconnect(&connection_id);
            return;
        }
    }

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(connection_id = %connection_id, "ignoring client message: {}", text.as_str());
                    }
                    Some(Err(err)) => {
                        tracing::debug!(connection_id = %connection_id, "websocket error: {err}");
                        break;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(frame) = encode(&event) else { continue };
                if sender.send(frame).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if awaiting_pong {
                    tracing::debug!(connection_id = %connection_id, "no pong since last ping, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    hub.disconnect(&connection_id);
    tracing::debug!(connection_id = %connection_id, "client disconnected");
}
