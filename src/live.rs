use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::fanout::Connection;
use crate::http_server::AppState;
use crate::types::CapturedEvent;

/// Viewer → server control frames.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { endpoint_id: String },
    Unsubscribe { endpoint_id: String },
    Ping,
}

/// Server → viewer frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { endpoint_id: String },
    Unsubscribed { endpoint_id: String },
    Webhook { event: CapturedEvent },
    Pong,
    Error { message: String },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let mut connection = state.subscriptions.connect();
    let id = connection.id();
    info!("live viewer {id} connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = connection.recv() => {
                let Some(event) = event else { break };
                let frame = ServerMessage::Webhook { event: (*event).clone() };
                if send(&mut sender, &frame).await.is_err() {
                    warn!("live viewer {id}: push failed, dropping connection");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_control(&state, &connection, text.as_str()).await;
                        if send(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    drop(connection);
    info!("live viewer {id} disconnected");
}

async fn handle_control(state: &AppState, connection: &Connection, text: &str) -> ServerMessage {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            return ServerMessage::Error {
                message: format!("invalid message: {e}"),
            }
        }
    };
    match msg {
        ClientMessage::Subscribe { endpoint_id } => match state.registry.get(&endpoint_id).await {
            Ok(_) => {
                connection.subscribe(&endpoint_id);
                debug!("live viewer {} watching {endpoint_id}", connection.id());
                ServerMessage::Subscribed { endpoint_id }
            }
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        },
        ClientMessage::Unsubscribe { endpoint_id } => {
            connection.unsubscribe(&endpoint_id);
            debug!("live viewer {} stopped watching {endpoint_id}", connection.id());
            ServerMessage::Unsubscribed { endpoint_id }
        }
        ClientMessage::Ping => ServerMessage::Pong,
    }
}

async fn send<S>(sender: &mut S, frame: &ServerMessage) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to encode live frame: {e}");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}
