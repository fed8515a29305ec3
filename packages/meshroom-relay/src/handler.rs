//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: assigning the session id,
//! parsing client messages, routing them through the relay state, and
//! cleaning up room membership when the socket goes away.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage, SignalKind};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Registers the connection and queues the `welcome` frame
/// 2. Spawns a sender task to forward outbound messages
/// 3. Processes incoming messages until the connection closes
/// 4. Disconnects the session, which leaves its room
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Register Session ──────────────────────────────────────────

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let welcome_tx = tx.clone();
    let session_id = state.connect_session(tx);

    // Queued before anything else can reach this session.
    let _ = welcome_tx.send(ServerMessage::Welcome {
        session_id: session_id.clone(),
    });
    drop(welcome_tx);

    // ── Step 2: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Step 3: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, &session_id, client_msg);
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = session_id.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    state.send_to_session(
                        &session_id,
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(session_id = session_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    session_id = session_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong; axum answers pings itself
        }
    }

    // ── Step 4: Cleanup ───────────────────────────────────────────────────

    state.disconnect_session(&session_id);
    sender_task.abort();
    tracing::info!(session_id = session_id.as_str(), "WebSocket disconnected");
}

/// Handle a parsed client message.
pub fn handle_client_message(state: &RelayState, session_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::JoinRoom { room_id } => {
            handle_join_room(state, session_id, &room_id);
        }

        ClientMessage::LeaveRoom { room_id } => {
            if state.leave_room(session_id, &room_id).is_none() {
                tracing::debug!(
                    session_id = session_id,
                    room_id = room_id.as_str(),
                    "Leave for a room the session is not in"
                );
            }
        }

        ClientMessage::Offer { to, payload } => {
            state.relay_signal(session_id, &to, SignalKind::Offer, payload);
        }

        ClientMessage::Answer { to, payload } => {
            state.relay_signal(session_id, &to, SignalKind::Answer, payload);
        }

        ClientMessage::Candidate { to, payload } => {
            state.relay_signal(session_id, &to, SignalKind::Candidate, payload);
        }

        ClientMessage::Ping => {
            state.send_to_session(session_id, ServerMessage::Pong);
        }
    }
}

fn handle_join_room(state: &RelayState, session_id: &str, room_id: &str) {
    if let Err(e) = state.join_room(session_id, room_id) {
        tracing::warn!(
            session_id = session_id,
            room_id = room_id,
            error = %e,
            "Join rejected"
        );
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: e.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayConfig;
    use serde_json::json;

    fn connect(state: &RelayState) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.connect_session(tx), rx)
    }

    #[test]
    fn test_ping_gets_pong() {
        let state = RelayState::new(RelayConfig::default());
        let (a, mut ra) = connect(&state);
        handle_client_message(&state, &a, ClientMessage::Ping);
        assert!(matches!(ra.try_recv(), Ok(ServerMessage::Pong)));
    }

    #[test]
    fn test_join_full_room_reports_error() {
        let state = RelayState::new(RelayConfig {
            max_room_members: 1,
            ..Default::default()
        });
        let (a, _ra) = connect(&state);
        let (b, mut rb) = connect(&state);
        handle_client_message(&state, &a, ClientMessage::JoinRoom { room_id: "R1".into() });
        handle_client_message(&state, &b, ClientMessage::JoinRoom { room_id: "R1".into() });

        match rb.try_recv() {
            Ok(ServerMessage::Error { message }) => assert!(message.contains("Room 'R1' is full")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_signals_forwarded_in_order() {
        let state = RelayState::new(RelayConfig::default());
        let (a, _ra) = connect(&state);
        let (b, mut rb) = connect(&state);
        handle_client_message(&state, &a, ClientMessage::JoinRoom { room_id: "R1".into() });
        handle_client_message(&state, &b, ClientMessage::JoinRoom { room_id: "R1".into() });
        let _ = rb.try_recv(); // existing-users

        handle_client_message(
            &state,
            &a,
            ClientMessage::Offer {
                to: b.clone(),
                payload: json!({"sdp": "o"}),
            },
        );
        for i in 0..3 {
            handle_client_message(
                &state,
                &a,
                ClientMessage::Candidate {
                    to: b.clone(),
                    payload: json!({ "candidate": i }),
                },
            );
        }

        assert!(matches!(rb.try_recv(), Ok(ServerMessage::Offer { .. })));
        for i in 0..3 {
            match rb.try_recv() {
                Ok(ServerMessage::Candidate { from, payload }) => {
                    assert_eq!(from, a);
                    assert_eq!(payload["candidate"], i);
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_leave_unknown_room_is_silent() {
        let state = RelayState::new(RelayConfig::default());
        let (a, mut ra) = connect(&state);
        handle_client_message(&state, &a, ClientMessage::LeaveRoom { room_id: "nope".into() });
        assert!(ra.try_recv().is_err());
    }
}
