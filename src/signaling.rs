//! Call signaling.
//!
//! Drives the call state machine from client events and routes the
//! resulting notifications. Parties are always reached through the
//! presence registry at the moment of delivery, never through a connection
//! captured earlier. Everything here is synchronous: no suspension point
//! sits between a presence lookup and the send that depends on it.
//!
//! WebRTC payloads travel through rooms untouched (`relay_signal`).

use chrono::{DateTime, Utc};

use crate::call::{CallSession, CallStatus};
use crate::error::{RelayError, Result};
use crate::protocol::{CallKind, ServerMessage};
use crate::state::RelayState;

/// A request to ring another user.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub caller_user_id: String,
    pub callee_user_id: String,
    pub room_id: String,
    pub caller_name: String,
    pub kind: CallKind,
    pub call_id: Option<String>,
}

/// What happened to a call request. The caller is told by the surface
/// that received the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiateOutcome {
    /// Callee unreachable. No session exists.
    NoAnswer,
    /// Callee's connection was notified.
    Ringing(CallSession),
    /// The pair already has an accepted call; rejoin its room.
    Rejoin(CallSession),
    /// The requester is already being rung by the other party. They get
    /// that call again instead of ringing back.
    Incoming(CallSession),
}

impl InitiateOutcome {
    /// The message the originating connection receives.
    pub fn to_caller_message(&self, state: &RelayState, callee_user_id: &str) -> ServerMessage {
        match self {
            InitiateOutcome::NoAnswer => ServerMessage::NoAnswer {
                callee_user_id: callee_user_id.to_string(),
            },
            InitiateOutcome::Ringing(session) => ServerMessage::CallRinging {
                room_id: session.room_id.clone(),
                callee_user_id: session.callee_user_id.clone(),
                callee_name: state
                    .directory
                    .resolve(session.kind, &session.callee_user_id)
                    .map(|p| p.name),
            },
            InitiateOutcome::Rejoin(session) => ServerMessage::CallAccepted {
                room_id: session.room_id.clone(),
            },
            InitiateOutcome::Incoming(session) => incoming_call(state, session, ""),
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(RelayError::Validation(format!("{} is required", field)))
    } else {
        Ok(())
    }
}

// ── Call Lifecycle ────────────────────────────────────────────────────────────

/// Ring the callee.
///
/// Presence is checked first: an unreachable callee yields `NoAnswer` and
/// leaves no session behind. A pair that already has an active call never
/// gets a second session: a pending call is rung again if the requester is
/// its caller, or handed back as `Incoming` if the requester is the one
/// being rung; an accepted call points both parties back at its room.
pub fn initiate_call(state: &RelayState, request: CallRequest) -> Result<InitiateOutcome> {
    require("callerUserId", &request.caller_user_id)?;
    require("calleeUserId", &request.callee_user_id)?;
    require("roomId", &request.room_id)?;
    if request.caller_user_id == request.callee_user_id {
        return Err(RelayError::Validation("Cannot call yourself".to_string()));
    }

    let callee_conn = match state.presence.lookup(&request.callee_user_id) {
        Some(conn) => conn,
        None => {
            tracing::info!(
                caller = request.caller_user_id.as_str(),
                callee = request.callee_user_id.as_str(),
                "Callee not present, no answer"
            );
            return Ok(InitiateOutcome::NoAnswer);
        }
    };

    if let Some(existing) = state
        .calls
        .active_for_pair(&request.caller_user_id, &request.callee_user_id)
    {
        return match existing.status {
            CallStatus::Accepted => {
                tracing::info!(
                    room_id = existing.room_id.as_str(),
                    "Call already accepted, rejoining"
                );
                Ok(InitiateOutcome::Rejoin(existing))
            }
            _ if existing.caller_user_id != request.caller_user_id => {
                tracing::debug!(
                    room_id = existing.room_id.as_str(),
                    user = request.caller_user_id.as_str(),
                    "Requester is already being rung by the other party"
                );
                Ok(InitiateOutcome::Incoming(existing))
            }
            _ => {
                let ring = incoming_call(state, &existing, &request.caller_name);
                if !state.send_to_connection(&callee_conn, ring) {
                    return Ok(InitiateOutcome::NoAnswer);
                }
                tracing::debug!(room_id = existing.room_id.as_str(), "Re-ringing pending call");
                Ok(InitiateOutcome::Ringing(existing))
            }
        };
    }

    let session = state.calls.create(CallSession::new(
        &request.room_id,
        &request.caller_user_id,
        &request.callee_user_id,
        request.kind,
        request.call_id.clone(),
        Utc::now(),
    ))?;

    let ring = incoming_call(state, &session, &request.caller_name);
    if !state.send_to_connection(&callee_conn, ring) {
        // Stale connection: same as no presence at all
        state.calls.discard(&session.room_id);
        tracing::info!(
            callee = request.callee_user_id.as_str(),
            conn = callee_conn.as_str(),
            "Callee connection gone, no answer"
        );
        return Ok(InitiateOutcome::NoAnswer);
    }

    Ok(InitiateOutcome::Ringing(session))
}

/// Build the `incomingCall` notification for the session's callee, enriched
/// with the caller's directory profile. A blank `caller_name` falls back to
/// the directory, then to the caller's id.
fn incoming_call(state: &RelayState, session: &CallSession, caller_name: &str) -> ServerMessage {
    let profile = state.directory.resolve_user(&session.caller_user_id);

    let caller_name = if !caller_name.trim().is_empty() {
        caller_name.to_string()
    } else {
        profile
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| session.caller_user_id.clone())
    };

    ServerMessage::IncomingCall {
        caller_user_id: session.caller_user_id.clone(),
        caller_name,
        room_id: session.room_id.clone(),
        kind: session.kind,
        call_id: session.call_id.clone(),
        caller_image: profile.as_ref().and_then(|p| p.profile_image.clone()),
        caller_location: profile.and_then(|p| p.location),
    }
}

/// Callee accepts. The caller is resolved again now; the connection that
/// initiated the call may be gone.
pub fn accept_call(state: &RelayState, caller_user_id: &str, room_id: &str) -> Result<CallSession> {
    let session = state.calls.accept(room_id, caller_user_id)?;

    let delivered = state.send_to_user(
        caller_user_id,
        ServerMessage::CallAccepted {
            room_id: room_id.to_string(),
        },
    );
    if !delivered {
        tracing::debug!(room_id = room_id, caller = caller_user_id, "Caller gone before accept");
    }
    Ok(session)
}

pub fn reject_call(state: &RelayState, caller_user_id: &str, room_id: &str) -> Result<CallSession> {
    let session = state.calls.reject(room_id, caller_user_id)?;

    state.send_to_user(
        caller_user_id,
        ServerMessage::CallRejected {
            room_id: Some(room_id.to_string()),
        },
    );
    Ok(session)
}

/// Either party hangs up, or the caller cancels while ringing.
///
/// Every other room member hears `callEnded`. The other party also hears
/// it on its current connection if that connection never joined the room
/// (a callee that is still ringing). The ending connection then leaves.
pub fn end_call(
    state: &RelayState,
    connection_id: Option<&str>,
    room_id: &str,
    user_id: &str,
) -> Result<CallSession> {
    let session = state.calls.end(room_id, user_id)?;
    let ended = ServerMessage::CallEnded {
        room_id: room_id.to_string(),
    };

    state.broadcast_to_room(room_id, connection_id, &ended);

    if let Some(other) = session.other_party(user_id) {
        if let Some(other_conn) = state.presence.lookup(other) {
            if Some(other_conn.as_str()) != connection_id
                && !state.rooms.is_member(room_id, &other_conn)
            {
                state.send_to_connection(&other_conn, ended);
            }
        }
    }

    if let Some(conn) = connection_id {
        state.rooms.leave(conn, room_id);
    }
    Ok(session)
}

// ── Rooms & Relay ─────────────────────────────────────────────────────────────

/// Add a connection to a room. Existing members get `ready` the first time
/// this connection joins; a duplicate join is silent.
pub fn join_room(state: &RelayState, connection_id: &str, room_id: &str) -> Result<()> {
    require("roomId", room_id)?;

    let outcome = state.rooms.join(connection_id, room_id);
    if outcome.newly_joined {
        for member in &outcome.others {
            state.send_to_connection(member, ServerMessage::Ready);
        }
    }
    Ok(())
}

pub fn leave_room(state: &RelayState, connection_id: &str, room_id: &str) {
    if let Some(remaining) = state.rooms.leave(connection_id, room_id) {
        for member in &remaining {
            state.send_to_connection(
                member,
                ServerMessage::PeerLeft {
                    room_id: room_id.to_string(),
                },
            );
        }
        if remaining.is_empty() {
            end_abandoned_call(state, room_id, Some(connection_id));
        }
    }
}

/// Forward an offer, answer or ICE candidate to every other room member.
/// Delivery is best-effort; returns how many members got it.
pub fn relay_signal(
    state: &RelayState,
    connection_id: &str,
    room_id: &str,
    message: ServerMessage,
) -> usize {
    let delivered = state.broadcast_to_room(room_id, Some(connection_id), &message);
    tracing::trace!(
        conn = connection_id,
        room_id = room_id,
        delivered = delivered,
        "Relayed signal"
    );
    delivered
}

// ── Reconciliation ────────────────────────────────────────────────────────────

/// Clean up after a closed connection.
///
/// Releases its presence and room memberships, then settles every pending
/// call of a user who is now unreachable: as callee the call is rejected
/// and the caller told; as caller the call is ended and the callee told.
/// An accepted call stays up while its room still has a member, so a
/// reconnecting party can rejoin; once the room is empty it is ended.
pub fn handle_disconnect(state: &RelayState, connection_id: &str) {
    let released = state.presence.release(connection_id);

    for (room_id, remaining) in state.rooms.remove_connection(connection_id) {
        for member in &remaining {
            state.send_to_connection(
                member,
                ServerMessage::PeerLeft {
                    room_id: room_id.clone(),
                },
            );
        }
        if remaining.is_empty() {
            end_abandoned_call(state, &room_id, Some(connection_id));
        }
    }

    // Accepted but never joined, or joined from another connection
    for user_id in &released {
        for session in state.calls.accepted_for_user(user_id) {
            end_abandoned_call(state, &session.room_id, Some(connection_id));
        }
    }

    for user_id in &released {
        for session in state.calls.pending_for_user(user_id) {
            let settled = if session.callee_user_id == *user_id {
                state
                    .calls
                    .reject(&session.room_id, &session.caller_user_id)
                    .map(|s| {
                        state.send_to_user(
                            &s.caller_user_id,
                            ServerMessage::CallRejected {
                                room_id: Some(s.room_id.clone()),
                            },
                        );
                    })
            } else {
                state.calls.end(&session.room_id, user_id).map(|s| {
                    state.send_to_user(
                        &s.callee_user_id,
                        ServerMessage::CallEnded {
                            room_id: s.room_id.clone(),
                        },
                    );
                })
            };

            match settled {
                Ok(()) => tracing::info!(
                    room_id = session.room_id.as_str(),
                    user = user_id.as_str(),
                    "Settled pending call after disconnect"
                ),
                // Another event got there first
                Err(e) => tracing::debug!(
                    room_id = session.room_id.as_str(),
                    error = %e,
                    "Pending call already settled"
                ),
            }
        }
    }

    state.remove_connection(connection_id);
}

/// End the accepted call in `room_id` if no connection is left in the room.
/// Parties still present hear `callEnded`, except on `trigger`.
fn end_abandoned_call(state: &RelayState, room_id: &str, trigger: Option<&str>) {
    let session = match state.calls.get(room_id) {
        Some(s) if s.status == CallStatus::Accepted => s,
        _ => return,
    };
    if !state.rooms.members_except(room_id, None).is_empty() {
        return;
    }

    let ended = match state.calls.end(room_id, &session.caller_user_id) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(room_id = room_id, error = %e, "Abandoned call already settled");
            return;
        }
    };

    for party in [&ended.caller_user_id, &ended.callee_user_id] {
        if let Some(conn) = state.presence.lookup(party) {
            if Some(conn.as_str()) != trigger {
                state.send_to_connection(
                    &conn,
                    ServerMessage::CallEnded {
                        room_id: room_id.to_string(),
                    },
                );
            }
        }
    }
    tracing::info!(room_id = room_id, "Ended call with an empty room");
}

/// Periodic maintenance: time out unanswered calls and drop old sessions.
pub fn expire_calls(state: &RelayState, now: DateTime<Utc>) {
    let timed_out = state.calls.expire(
        now,
        state.config.ring_timeout_secs,
        state.config.call_retention_secs,
    );

    for session in timed_out {
        state.send_to_user(
            &session.caller_user_id,
            ServerMessage::CallRejected {
                room_id: Some(session.room_id.clone()),
            },
        );
        state.send_to_user(
            &session.callee_user_id,
            ServerMessage::CallEnded {
                room_id: session.room_id.clone(),
            },
        );
    }
}
