//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: authenticating the session,
//! opening a channel connection, routing client messages through the relay
//! state, and forwarding pushed events back to the socket.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use giftbox_core::{ConnectionId, Error, Identity, MessageBody, Target};
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::RelayState;

/// Replies waiting for the socket. When full, reading from the client pauses.
pub(crate) const REPLY_QUEUE_CAPACITY: usize = 32;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Waits for a `Register` message carrying a valid session token
/// 2. Opens a channel connection and spawns a sender task for pushes and replies
/// 3. Processes incoming messages until the connection closes
/// 4. Closes the channel connection so nothing more is pushed to it
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Wait for Registration ─────────────────────────────────────

    let identity = loop {
        let reply = match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Register { token }) => match state.resolve_session(&token) {
                    Some(identity) => break identity,
                    None => ServerMessage::error(&Error::AuthenticationFailed),
                },
                Ok(ClientMessage::Ping) => ServerMessage::Pong,
                Ok(_) => ServerMessage::error(&Error::InvalidOperation(
                    "Must register before sending other messages".into(),
                )),
                Err(e) => {
                    tracing::warn!("Failed to parse client message: {}", e);
                    ServerMessage::error(&Error::SerializationError(format!(
                        "Invalid message format: {}",
                        e
                    )))
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
                continue;
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                return; // Connection closed before registration
            }
            _ => continue,
        };

        if send_frame(&mut ws_sender, &reply).await.is_err() {
            return;
        }
    };

    // ── Step 2: Open Channel Connection ───────────────────────────────────

    let connections = state.core.channel.connections();
    let (conn_id, mut events) = connections.open(&identity);

    let registered = ServerMessage::Registered {
        identity: identity.to_string(),
        connection_id: conn_id.to_string(),
    };
    if send_frame(&mut ws_sender, &registered).await.is_err() {
        connections.close(conn_id);
        return;
    }
    tracing::info!(identity = %identity, conn = %conn_id, "WebSocket registered");

    // ── Step 3: Spawn Sender Task ─────────────────────────────────────────

    // Replies wait for space in their queue; pushes come from the channel
    // queue and are dropped upstream when it is full.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(REPLY_QUEUE_CAPACITY);

    let sender_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(reply) = rx.recv() => reply,
                Some(event) = events.recv() => ServerMessage::from(event),
                else => break,
            };
            if send_frame(&mut ws_sender, &msg).await.is_err() {
                break; // Connection closed
            }
        }
    });

    // ── Step 4: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        handle_client_message(&state, &identity, conn_id, client_msg).await
                    }
                    Err(e) => {
                        tracing::warn!(
                            identity = %identity,
                            error = %e,
                            "Failed to parse client message"
                        );
                        ServerMessage::error(&Error::SerializationError(format!(
                            "Invalid message format: {}",
                            e
                        )))
                    }
                };
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!(identity = %identity, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Ping, Pong; axum answers pings itself
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    connections.close(conn_id);
    sender_task.abort();
    tracing::info!(identity = %identity, conn = %conn_id, "WebSocket disconnected");
}

async fn send_frame<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(Message::Text(json)).await.map_err(|_| ()),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            Ok(())
        }
    }
}

/// Handle a parsed client message and produce the direct reply.
async fn handle_client_message(
    state: &RelayState,
    identity: &Identity,
    conn_id: ConnectionId,
    msg: ClientMessage,
) -> ServerMessage {
    let result = match msg {
        ClientMessage::Register { .. } => {
            Err(Error::InvalidOperation("Already registered".into()))
        }

        ClientMessage::Send { target, text, attachment, ref_id } => state
            .send_message(identity, target, MessageBody { text, attachment })
            .await
            .map(|message_id| ServerMessage::Ack { ref_id, message_id }),

        ClientMessage::Subscribe { target } => state
            .core
            .channel
            .connections()
            .subscribe(conn_id, target.clone())
            .map(|()| ServerMessage::Subscribed { target }),

        ClientMessage::Unsubscribe { target } => state
            .core
            .channel
            .connections()
            .unsubscribe(conn_id, &target)
            .map(|()| ServerMessage::Unsubscribed { target }),

        ClientMessage::History { target } => {
            let messages = match &target {
                Target::Peer(peer) => state.core.channel.history(identity, peer),
                Target::Room(room) => state.core.channel.room_history(room),
            };
            messages.map(|messages| ServerMessage::History { target, messages })
        }

        ClientMessage::Ping => Ok(ServerMessage::Pong),
    };

    result.unwrap_or_else(|e| {
        tracing::debug!(identity = %identity, error = %e, "Client request failed");
        ServerMessage::error(&e)
    })
}
