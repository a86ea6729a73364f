//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! dispatching them to signaling and chat, and sending responses.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::broadcast;
use crate::error::RelayError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::signaling::{self, CallRequest};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Assigns a connection ID and spawns a sender task for outbound messages
/// 2. Processes incoming messages until the connection closes
/// 3. Reconciles presence, rooms and pending calls on the way out
///
/// No registration is required up front; `register` can arrive at any time
/// and may be repeated.
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.add_connection(&connection_id, tx);
    tracing::info!(conn = connection_id.as_str(), "WebSocket connected");

    // ── Sender Task ───────────────────────────────────────────────────────

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

    // ── Process Messages ──────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, &connection_id, client_msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        conn = connection_id.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    state.send_to_connection(
                        &connection_id,
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(conn = connection_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    conn = connection_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong: axum answers pings itself
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    signaling::handle_disconnect(&state, &connection_id);
    sender_task.abort();
    tracing::info!(conn = connection_id.as_str(), "WebSocket disconnected");
}

/// Handle a parsed client message.
///
/// Failures are reported to this connection only.
pub async fn handle_client_message(state: &RelayState, connection_id: &str, msg: ClientMessage) {
    if let Err(e) = dispatch(state, connection_id, msg).await {
        report(state, connection_id, e);
    }
}

async fn dispatch(
    state: &RelayState,
    connection_id: &str,
    msg: ClientMessage,
) -> crate::error::Result<()> {
    match msg {
        ClientMessage::Register { user_id } => {
            if state.presence.register(&user_id, connection_id) {
                tracing::info!(
                    conn = connection_id,
                    user = user_id.as_str(),
                    "User registered"
                );
                state.send_to_connection(
                    connection_id,
                    ServerMessage::Registered {
                        user_id,
                        connection_id: connection_id.to_string(),
                    },
                );
            }
        }

        ClientMessage::InitiateCall {
            callee_user_id,
            room_id,
            caller_user_id,
            caller_name,
            kind,
            call_id,
        } => {
            let outcome = signaling::initiate_call(
                state,
                CallRequest {
                    caller_user_id,
                    callee_user_id: callee_user_id.clone(),
                    room_id,
                    caller_name,
                    kind,
                    call_id,
                },
            )?;
            state.send_to_connection(
                connection_id,
                outcome.to_caller_message(state, &callee_user_id),
            );
        }

        ClientMessage::AcceptCall {
            caller_user_id,
            room_id,
        } => {
            signaling::accept_call(state, &caller_user_id, &room_id)?;
        }

        ClientMessage::RejectCall {
            caller_user_id,
            room_id,
        } => {
            signaling::reject_call(state, &caller_user_id, &room_id)?;
        }

        ClientMessage::EndCall { room_id, user_id } => {
            signaling::end_call(state, Some(connection_id), &room_id, &user_id)?;
        }

        ClientMessage::JoinRoom { room_id } => {
            signaling::join_room(state, connection_id, &room_id)?;
        }

        ClientMessage::LeaveRoom { room_id } => {
            signaling::leave_room(state, connection_id, &room_id);
        }

        ClientMessage::Offer { room_id, offer } => {
            let forwarded = ServerMessage::Offer {
                room_id: room_id.clone(),
                offer,
            };
            signaling::relay_signal(state, connection_id, &room_id, forwarded);
        }

        ClientMessage::Answer { room_id, answer } => {
            let forwarded = ServerMessage::Answer {
                room_id: room_id.clone(),
                answer,
            };
            signaling::relay_signal(state, connection_id, &room_id, forwarded);
        }

        ClientMessage::IceCandidate { room_id, candidate } => {
            let forwarded = ServerMessage::IceCandidate {
                room_id: room_id.clone(),
                candidate,
            };
            signaling::relay_signal(state, connection_id, &room_id, forwarded);
        }

        ClientMessage::SendMessage {
            room_id,
            author_user_id,
            text,
            image_ref,
        } => {
            broadcast::send_message(state, &room_id, &author_user_id, &text, image_ref).await?;
        }

        ClientMessage::UpdateMessage { message_id, text } => {
            broadcast::edit_message(state, &message_id, &text).await?;
        }

        ClientMessage::DeleteMessage { message_id } => {
            broadcast::delete_message(state, &message_id).await?;
        }

        ClientMessage::FetchHistory { room_id, limit } => {
            let messages = broadcast::history(state, &room_id, limit).await?;
            state.send_to_connection(
                connection_id,
                ServerMessage::MessageHistory { room_id, messages },
            );
        }

        ClientMessage::Ping => {
            state.send_to_connection(connection_id, ServerMessage::Pong);
        }
    }
    Ok(())
}

fn report(state: &RelayState, connection_id: &str, error: RelayError) {
    match error {
        // Late or duplicate call events are expected and never re-notify
        RelayError::IllegalTransition { .. } => {
            tracing::debug!(conn = connection_id, error = %error, "Ignoring call event");
        }
        RelayError::Store(ref detail) => {
            tracing::error!(conn = connection_id, error = detail.as_str(), "Chat store failure");
            state.send_to_connection(
                connection_id,
                ServerMessage::Error {
                    message: error.client_message(),
                },
            );
        }
        _ => {
            tracing::debug!(conn = connection_id, error = %error, "Request rejected");
            state.send_to_connection(
                connection_id,
                ServerMessage::Error {
                    message: error.client_message(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayConfig;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(state: &RelayState, conn: &str) -> UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.add_connection(conn, tx);
        rx
    }

    fn parse(json: &str) -> ClientMessage {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_register_acknowledges() {
        let state = RelayState::in_memory(RelayConfig::default()).unwrap();
        let mut rx = connect(&state, "C1");

        handle_client_message(&state, "C1", parse(r#"{"type":"register","userId":"U1"}"#)).await;

        match rx.try_recv().unwrap() {
            ServerMessage::Registered {
                user_id,
                connection_id,
            } => {
                assert_eq!(user_id, "U1");
                assert_eq!(connection_id, "C1");
            }
            other => panic!("Expected Registered, got {:?}", other),
        }
        assert_eq!(state.presence.lookup("U1").as_deref(), Some("C1"));
    }

    #[tokio::test]
    async fn test_empty_register_is_silently_ignored() {
        let state = RelayState::in_memory(RelayConfig::default()).unwrap();
        let mut rx = connect(&state, "C1");

        handle_client_message(&state, "C1", parse(r#"{"type":"register","userId":""}"#)).await;
        handle_client_message(&state, "C1", parse(r#"{"type":"register"}"#)).await;

        assert!(rx.try_recv().is_err());
        assert!(state.presence.is_empty());
    }

    #[tokio::test]
    async fn test_initiate_without_presence_sends_one_no_answer() {
        let state = RelayState::in_memory(RelayConfig::default()).unwrap();
        let mut rx = connect(&state, "C1");

        handle_client_message(
            &state,
            "C1",
            parse(r#"{"type":"initiateCall","calleeUserId":"U2","roomId":"R1","callerUserId":"U1","callerName":"Ramesh"}"#),
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerMessage::NoAnswer { callee_user_id } => assert_eq!(callee_user_id, "U2"),
            other => panic!("Expected NoAnswer, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert!(state.calls.is_empty());
    }

    #[tokio::test]
    async fn test_late_accept_is_silent() {
        let state = RelayState::in_memory(RelayConfig::default()).unwrap();
        let mut c1 = connect(&state, "C1");
        let mut c2 = connect(&state, "C2");
        handle_client_message(&state, "C1", parse(r#"{"type":"register","userId":"U1"}"#)).await;
        handle_client_message(&state, "C2", parse(r#"{"type":"register","userId":"U2"}"#)).await;
        handle_client_message(
            &state,
            "C1",
            parse(r#"{"type":"initiateCall","calleeUserId":"U2","roomId":"R1","callerUserId":"U1"}"#),
        )
        .await;
        handle_client_message(
            &state,
            "C1",
            parse(r#"{"type":"endCall","roomId":"R1","userId":"U1"}"#),
        )
        .await;
        while c1.try_recv().is_ok() {}
        while c2.try_recv().is_ok() {}

        handle_client_message(
            &state,
            "C2",
            parse(r#"{"type":"acceptCall","callerUserId":"U1","roomId":"R1"}"#),
        )
        .await;

        assert!(c1.try_recv().is_err());
        assert!(c2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_validation_error_goes_to_sender_only() {
        let state = RelayState::in_memory(RelayConfig::default()).unwrap();
        let mut a = connect(&state, "A");
        let mut b = connect(&state, "B");
        state.rooms.join("A", "farmers");
        state.rooms.join("B", "farmers");

        handle_client_message(
            &state,
            "A",
            parse(r#"{"type":"sendMessage","roomId":"farmers","authorUserId":"U1","text":""}"#),
        )
        .await;

        assert!(matches!(a.try_recv().unwrap(), ServerMessage::Error { .. }));
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fetch_history_replies_to_requester() {
        let state = RelayState::in_memory(RelayConfig::default()).unwrap();
        let mut a = connect(&state, "A");
        state.rooms.join("A", "farmers");

        handle_client_message(
            &state,
            "A",
            parse(r#"{"type":"sendMessage","roomId":"farmers","authorUserId":"U1","text":"hello"}"#),
        )
        .await;
        assert!(matches!(a.try_recv().unwrap(), ServerMessage::ReceiveMessage(_)));

        handle_client_message(&state, "A", parse(r#"{"type":"fetchHistory","roomId":"farmers"}"#))
            .await;
        match a.try_recv().unwrap() {
            ServerMessage::MessageHistory { room_id, messages } => {
                assert_eq!(room_id, "farmers");
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].text, "hello");
            }
            other => panic!("Expected MessageHistory, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let state = RelayState::in_memory(RelayConfig::default()).unwrap();
        let mut rx = connect(&state, "C1");
        handle_client_message(&state, "C1", ClientMessage::Ping).await;
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Pong));
    }
}
