//! REST API handlers.
//!
//! A thin HTTP adapter over the same call and chat operations the
//! WebSocket dispatch uses, for application servers that drive calls and
//! moderate chat without holding a socket. Also carries the operational
//! endpoints (`/health`, `/stats`, `/presence`).

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::call::CallSession;
use crate::chat::broadcast::{self, MAX_HISTORY_LIMIT};
use crate::directory::Profile;
use crate::error::{RelayError, Result};
use crate::protocol::CallKind;
use crate::signaling::{self, CallRequest, InitiateOutcome};
use crate::state::RelayState;

/// Default page size for call history.
const DEFAULT_CALL_HISTORY_LIMIT: usize = 20;

/// Routes served under `/api`.
pub fn routes() -> Router<RelayState> {
    Router::new()
        .route("/api/calls", post(initiate_call))
        .route("/api/calls/:room_id", get(get_call))
        .route("/api/calls/:room_id/accept", post(accept_call))
        .route("/api/calls/:room_id/reject", post(reject_call))
        .route("/api/calls/:room_id/end", post(end_call))
        .route("/api/users/:user_id/calls", get(call_history))
        .route("/api/rooms/:room_id/messages", get(room_messages))
        .route(
            "/api/messages/:message_id",
            patch(edit_message).delete(delete_message),
        )
        .route("/api/directory/users/:id", put(upsert_user))
        .route("/api/directory/specialists/:id", put(upsert_specialist))
}

// ── Request / Response Types ─────────────────────────────────────────────────

/// POST /api/calls
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallRequest {
    pub caller_user_id: String,
    pub callee_user_id: String,
    /// Generated when absent.
    pub room_id: Option<String>,
    #[serde(default)]
    pub caller_name: String,
    #[serde(default)]
    pub kind: CallKind,
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallAttemptStatus {
    Ringing,
    NoAnswer,
    Rejoin,
    /// The callee is already ringing the caller; answer that call instead.
    Incoming,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallResponse {
    pub status: CallAttemptStatus,
    pub room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<CallSession>,
}

/// POST /api/calls/:roomId/accept and /reject
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerCallRequest {
    pub caller_user_id: String,
}

/// POST /api/calls/:roomId/end
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallRequest {
    pub user_id: String,
}

/// PATCH /api/messages/:id
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    pub user_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequesterQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// PUT /api/directory/...; the id comes from the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub name: String,
    pub profile_image: Option<String>,
    pub location: Option<String>,
    pub specialization: Option<String>,
}

impl ProfileUpdate {
    fn into_profile(self, id: String) -> Result<Profile> {
        if id.trim().is_empty() || self.name.trim().is_empty() {
            return Err(RelayError::Validation("id and name are required".to_string()));
        }
        Ok(Profile {
            id,
            name: self.name,
            profile_image: self.profile_image,
            location: self.location,
            specialization: self.specialization,
        })
    }
}

/// Generic success response.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Json<Self> {
        Json(Self {
            ok: true,
            data: Some(data),
            error: None,
        })
    }
}

// ── Operational Handlers ─────────────────────────────────────────────────────

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "kisan-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
pub async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "connections": state.connection_count(),
        "registered_users": state.presence.len(),
        "rooms": state.rooms.room_count(),
        "active_calls": state.calls.active_count(),
        "total_calls": state.calls.len(),
    }))
}

/// Current user → connection mapping.
pub async fn presence_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let mut entries = state.presence.snapshot();
    entries.sort();
    let users: Vec<_> = entries
        .into_iter()
        .map(|(user_id, connection_id)| json!({ "userId": user_id, "connectionId": connection_id }))
        .collect();
    ApiResponse::success(users)
}

// ── Call Handlers ────────────────────────────────────────────────────────────

/// POST /api/calls: ring a user.
///
/// Same semantics as the `initiateCall` socket message; the caller's
/// result comes back in the response instead of over a socket.
pub async fn initiate_call(
    State(state): State<RelayState>,
    Json(req): Json<InitiateCallRequest>,
) -> Result<impl IntoResponse> {
    let room_id = req
        .room_id
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| format!("room-{}", Uuid::new_v4()));

    let outcome = signaling::initiate_call(
        &state,
        CallRequest {
            caller_user_id: req.caller_user_id,
            callee_user_id: req.callee_user_id,
            room_id: room_id.clone(),
            caller_name: req.caller_name,
            kind: req.kind,
            call_id: req.call_id,
        },
    )?;

    let response = match outcome {
        InitiateOutcome::NoAnswer => InitiateCallResponse {
            status: CallAttemptStatus::NoAnswer,
            room_id,
            session: None,
        },
        InitiateOutcome::Ringing(session) => InitiateCallResponse {
            status: CallAttemptStatus::Ringing,
            room_id: session.room_id.clone(),
            session: Some(session),
        },
        InitiateOutcome::Rejoin(session) => InitiateCallResponse {
            status: CallAttemptStatus::Rejoin,
            room_id: session.room_id.clone(),
            session: Some(session),
        },
        InitiateOutcome::Incoming(session) => InitiateCallResponse {
            status: CallAttemptStatus::Incoming,
            room_id: session.room_id.clone(),
            session: Some(session),
        },
    };
    Ok(ApiResponse::success(response))
}

/// GET /api/calls/:roomId
pub async fn get_call(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = state
        .calls
        .get(&room_id)
        .ok_or(RelayError::CallNotFound(room_id))?;
    Ok(ApiResponse::success(session))
}

pub async fn accept_call(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(req): Json<AnswerCallRequest>,
) -> Result<impl IntoResponse> {
    let session = signaling::accept_call(&state, &req.caller_user_id, &room_id)?;
    Ok(ApiResponse::success(session))
}

pub async fn reject_call(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(req): Json<AnswerCallRequest>,
) -> Result<impl IntoResponse> {
    let session = signaling::reject_call(&state, &req.caller_user_id, &room_id)?;
    Ok(ApiResponse::success(session))
}

/// POST /api/calls/:roomId/end: hang up on behalf of a party.
/// Every room member hears `callEnded`.
pub async fn end_call(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(req): Json<EndCallRequest>,
) -> Result<impl IntoResponse> {
    let session = signaling::end_call(&state, None, &room_id, &req.user_id)?;
    Ok(ApiResponse::success(session))
}

/// GET /api/users/:userId/calls: call history, newest first.
pub async fn call_history(
    State(state): State<RelayState>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CALL_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    ApiResponse::success(state.calls.history_for_user(&user_id, limit))
}

// ── Chat Handlers ────────────────────────────────────────────────────────────

pub async fn room_messages(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse> {
    let messages = broadcast::history(&state, &room_id, query.limit).await?;
    Ok(ApiResponse::success(messages))
}

/// Only the author may change a message.
async fn check_author(state: &RelayState, message_id: &str, user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(RelayError::Validation("userId is required".to_string()));
    }

    let message = state
        .chat_store
        .find_by_id(message_id)
        .await?
        .ok_or_else(|| RelayError::MessageNotFound(message_id.to_string()))?;

    if message.author_user_id != user_id {
        return Err(RelayError::Forbidden(
            "Only the author can change this message".to_string(),
        ));
    }
    Ok(())
}

/// PATCH /api/messages/:id
pub async fn edit_message(
    State(state): State<RelayState>,
    Path(message_id): Path<String>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse> {
    check_author(&state, &message_id, &req.user_id).await?;
    let message = broadcast::edit_message(&state, &message_id, &req.text).await?;
    Ok(ApiResponse::success(message))
}

/// DELETE /api/messages/:id?userId=
pub async fn delete_message(
    State(state): State<RelayState>,
    Path(message_id): Path<String>,
    Query(query): Query<RequesterQuery>,
) -> Result<impl IntoResponse> {
    check_author(&state, &message_id, &query.user_id).await?;
    let removed = broadcast::delete_message(&state, &message_id).await?;
    Ok(ApiResponse::success(json!({
        "messageId": removed.id,
        "roomId": removed.room_id,
    })))
}

// ── Directory Handlers ───────────────────────────────────────────────────────

pub async fn upsert_user(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    Json(update): Json<ProfileUpdate>,
) -> Result<impl IntoResponse> {
    let profile = update.into_profile(id)?;
    state.directory.upsert(CallKind::Generic, profile.clone())?;
    Ok(ApiResponse::success(profile))
}

pub async fn upsert_specialist(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    Json(update): Json<ProfileUpdate>,
) -> Result<impl IntoResponse> {
    let profile = update.into_profile(id)?;
    state.directory.upsert(CallKind::Specialist, profile.clone())?;
    Ok(ApiResponse::success(profile))
}
