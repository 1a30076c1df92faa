use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::AppState;
use crate::ws::protocol;

/// Run the actor-per-connection pattern for one WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader loop: processes incoming frames in order, dispatches to the protocol handler
///
/// The session is registered before the first frame is read and removed as
/// soon as the reader loop ends, so broadcasts never target a closed socket.
pub async fn run_connection(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let connection_id = Uuid::now_v7();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    state.sessions.register(connection_id, tx.clone());

    tracing::info!(
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        "New client connected"
    );

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Reader loop: frames from one connection are handled strictly in order
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(text.as_str(), connection_id, &tx, &state)
                        .await;
                }
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    // Binary frames carry the same JSON, just untagged as text
                    Ok(text) => {
                        protocol::handle_text_message(text, connection_id, &tx, &state).await;
                    }
                    Err(e) => {
                        tracing::warn!(
                            connection_id = %connection_id,
                            error = %e,
                            bytes = data.len(),
                            "Invalid message received: binary frame is not UTF-8"
                        );
                    }
                },
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended: client disconnected
                break;
            }
        }
    }

    // Deregister before tearing down the writer so no broadcast picks us up
    let name = state.sessions.name_of(connection_id);
    state.sessions.unregister(connection_id);
    writer_handle.abort();

    tracing::info!(
        connection_id = %connection_id,
        name = ?name,
        sessions = state.sessions.len(),
        "Client disconnected"
    );
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed, connection is broken
            break;
        }
    }
}
