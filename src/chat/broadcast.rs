//! Chat operations shared by the WebSocket handler and the REST API.
//!
//! Each operation validates, writes through the store, and then fans the
//! result out to the message's room. A store failure stops the operation
//! before anything is broadcast.

use crate::directory::Directory;
use crate::error::{RelayError, Result};
use crate::protocol::{ChatMessage, ServerMessage};
use crate::state::RelayState;

use super::store::{NewMessage, StoredMessage};

/// Upper bound on a single history page.
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Attach author display fields to a stored message.
pub fn to_chat_message(directory: &dyn Directory, stored: StoredMessage) -> ChatMessage {
    ChatMessage {
        author: directory.author(&stored.author_user_id),
        id: stored.id,
        room_id: stored.room_id,
        text: stored.text,
        image_ref: stored.image_ref,
        created_at: stored.created_at,
        edited: stored.edited,
    }
}

/// Persist a new message and deliver it to every member of the room,
/// the sender included.
pub async fn send_message(
    state: &RelayState,
    room_id: &str,
    author_user_id: &str,
    text: &str,
    image_ref: Option<String>,
) -> Result<ChatMessage> {
    if room_id.trim().is_empty() {
        return Err(RelayError::Validation("roomId is required".to_string()));
    }
    if author_user_id.trim().is_empty() {
        return Err(RelayError::Validation("authorUserId is required".to_string()));
    }

    let image_ref = image_ref.filter(|r| !r.trim().is_empty());
    if text.trim().is_empty() && image_ref.is_none() {
        return Err(RelayError::Validation(
            "Message must have text or an image".to_string(),
        ));
    }

    let stored = state
        .chat_store
        .create(NewMessage {
            room_id: room_id.to_string(),
            author_user_id: author_user_id.to_string(),
            text: text.to_string(),
            image_ref,
        })
        .await?;

    let message = to_chat_message(state.directory.as_ref(), stored);
    let delivered = state.broadcast_to_room(
        room_id,
        None,
        &ServerMessage::ReceiveMessage(message.clone()),
    );

    tracing::debug!(
        room_id = room_id,
        author = author_user_id,
        message_id = message.id.as_str(),
        delivered = delivered,
        "Chat message sent"
    );
    Ok(message)
}

/// Replace a message's text and broadcast the edited message to its room.
pub async fn edit_message(state: &RelayState, message_id: &str, text: &str) -> Result<ChatMessage> {
    let existing = state
        .chat_store
        .find_by_id(message_id)
        .await?
        .ok_or_else(|| RelayError::MessageNotFound(message_id.to_string()))?;

    if text.trim().is_empty() && existing.image_ref.is_none() {
        return Err(RelayError::Validation(
            "Edited message must keep text or an image".to_string(),
        ));
    }

    let stored = state.chat_store.update_text(message_id, text).await?;
    let message = to_chat_message(state.directory.as_ref(), stored);

    state.broadcast_to_room(
        &message.room_id,
        None,
        &ServerMessage::MessageUpdated(message.clone()),
    );

    tracing::debug!(message_id = message_id, "Chat message edited");
    Ok(message)
}

/// Remove a message and tell its room. Returns the removed record.
pub async fn delete_message(state: &RelayState, message_id: &str) -> Result<StoredMessage> {
    let removed = state.chat_store.delete(message_id).await?;

    state.broadcast_to_room(
        &removed.room_id,
        None,
        &ServerMessage::MessageDeleted {
            message_id: removed.id.clone(),
            room_id: removed.room_id.clone(),
        },
    );

    tracing::debug!(message_id = message_id, "Chat message deleted");
    Ok(removed)
}

/// Most recent messages of a room, oldest first.
pub async fn history(
    state: &RelayState,
    room_id: &str,
    limit: Option<usize>,
) -> Result<Vec<ChatMessage>> {
    let limit = limit
        .unwrap_or(state.config.history_limit)
        .clamp(1, MAX_HISTORY_LIMIT);

    let stored = state.chat_store.list_room(room_id, limit).await?;
    Ok(stored
        .into_iter()
        .map(|m| to_chat_message(state.directory.as_ref(), m))
        .collect())
}
