//! Call sessions.
//!
//! One session per call attempt, keyed by the caller-generated room id.
//! Generic and specialist calls share this state machine:
//!
//! ```text
//!             accept              end
//!   pending ─────────► accepted ─────────► ended
//!      │                                     ▲
//!      │ reject / ring timeout               │ end (caller cancels)
//!      ▼                                     │
//!   rejected            pending ─────────────┘
//! ```
//!
//! Nothing leaves `rejected` or `ended`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::protocol::CallKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    Pending,
    Accepted,
    Rejected,
    Ended,
}

impl CallStatus {
    /// Pending or accepted.
    pub fn is_active(self) -> bool {
        matches!(self, CallStatus::Pending | CallStatus::Accepted)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Pending => "pending",
            CallStatus::Accepted => "accepted",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// The record of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub room_id: String,
    pub caller_user_id: String,
    pub callee_user_id: String,
    pub kind: CallKind,
    /// Persisted call record id supplied by specialist calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Talk time in seconds, set when an accepted call ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

impl CallSession {
    pub fn new(
        room_id: &str,
        caller_user_id: &str,
        callee_user_id: &str,
        kind: CallKind,
        call_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            caller_user_id: caller_user_id.to_string(),
            callee_user_id: callee_user_id.to_string(),
            kind,
            call_id,
            status: CallStatus::Pending,
            created_at: now,
            accepted_at: None,
            ended_at: None,
            duration_secs: None,
        }
    }

    pub fn accept(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[CallStatus::Pending], "accept")?;
        self.status = CallStatus::Accepted;
        self.accepted_at = Some(now);
        Ok(())
    }

    pub fn reject(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[CallStatus::Pending], "reject")?;
        self.status = CallStatus::Rejected;
        self.ended_at = Some(now);
        Ok(())
    }

    pub fn end(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[CallStatus::Pending, CallStatus::Accepted], "end")?;
        if let Some(accepted_at) = self.accepted_at {
            self.duration_secs = Some((now - accepted_at).num_seconds().max(0));
        }
        self.status = CallStatus::Ended;
        self.ended_at = Some(now);
        Ok(())
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.caller_user_id == user_id || self.callee_user_id == user_id
    }

    /// The party that is not `user_id`.
    pub fn other_party(&self, user_id: &str) -> Option<&str> {
        if self.caller_user_id == user_id {
            Some(&self.callee_user_id)
        } else if self.callee_user_id == user_id {
            Some(&self.caller_user_id)
        } else {
            None
        }
    }

    fn pair_key(&self) -> (String, String) {
        pair_key(&self.caller_user_id, &self.callee_user_id)
    }

    fn expect_status(&self, allowed: &[CallStatus], event: &'static str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(RelayError::IllegalTransition {
                room_id: self.room_id.clone(),
                from: self.status,
                event,
            })
        }
    }
}

/// Unordered pair key.
fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Owns all call sessions and the one-active-call-per-pair index.
#[derive(Clone, Default)]
pub struct CallRegistry {
    /// Room ID → session.
    sessions: Arc<DashMap<String, CallSession>>,

    /// Unordered (user, user) → room ID of their active session.
    ///
    /// Lock order: `active_pairs` may be held while touching `sessions`,
    /// never the reverse.
    active_pairs: Arc<DashMap<(String, String), String>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new pending session. Fails if the room id is taken or the
    /// pair already has an active call.
    pub fn create(&self, session: CallSession) -> Result<CallSession> {
        match self.active_pairs.entry(session.pair_key()) {
            Entry::Occupied(existing) => Err(RelayError::Validation(format!(
                "A call between these users is already active in room '{}'",
                existing.get()
            ))),
            Entry::Vacant(pair) => match self.sessions.entry(session.room_id.clone()) {
                Entry::Occupied(_) => Err(RelayError::RoomInUse(session.room_id.clone())),
                Entry::Vacant(slot) => {
                    slot.insert(session.clone());
                    pair.insert(session.room_id.clone());
                    tracing::info!(
                        room_id = session.room_id.as_str(),
                        caller = session.caller_user_id.as_str(),
                        callee = session.callee_user_id.as_str(),
                        kind = %session.kind,
                        "Call session created"
                    );
                    Ok(session)
                }
            },
        }
    }

    pub fn get(&self, room_id: &str) -> Option<CallSession> {
        self.sessions.get(room_id).map(|s| s.clone())
    }

    /// The active session between two users, if any.
    pub fn active_for_pair(&self, a: &str, b: &str) -> Option<CallSession> {
        let room_id = self
            .active_pairs
            .get(&pair_key(a, b))
            .map(|room| room.value().clone())?;
        self.get(&room_id).filter(|s| s.status.is_active())
    }

    /// pending → accepted. `caller_user_id` must name the session's caller.
    pub fn accept(&self, room_id: &str, caller_user_id: &str) -> Result<CallSession> {
        let session = {
            let mut session = self
                .sessions
                .get_mut(room_id)
                .ok_or_else(|| RelayError::CallNotFound(room_id.to_string()))?;
            check_caller(&session, caller_user_id)?;
            session.accept(Utc::now())?;
            session.clone()
        };

        tracing::info!(room_id = room_id, "Call accepted");
        Ok(session)
    }

    /// pending → rejected.
    pub fn reject(&self, room_id: &str, caller_user_id: &str) -> Result<CallSession> {
        let session = {
            let mut session = self
                .sessions
                .get_mut(room_id)
                .ok_or_else(|| RelayError::CallNotFound(room_id.to_string()))?;
            check_caller(&session, caller_user_id)?;
            session.reject(Utc::now())?;
            session.clone()
        };

        self.release_pair(&session);
        tracing::info!(room_id = room_id, "Call rejected");
        Ok(session)
    }

    /// pending | accepted → ended, by either party.
    pub fn end(&self, room_id: &str, user_id: &str) -> Result<CallSession> {
        let session = {
            let mut session = self
                .sessions
                .get_mut(room_id)
                .ok_or_else(|| RelayError::CallNotFound(room_id.to_string()))?;
            if !session.involves(user_id) {
                return Err(RelayError::Validation(format!(
                    "User '{}' is not a party to call '{}'",
                    user_id, room_id
                )));
            }
            session.end(Utc::now())?;
            session.clone()
        };

        self.release_pair(&session);
        tracing::info!(
            room_id = room_id,
            by = user_id,
            duration_secs = session.duration_secs,
            "Call ended"
        );
        Ok(session)
    }

    /// Remove a pending session that never rang.
    pub fn discard(&self, room_id: &str) -> Option<CallSession> {
        let (_, session) = self
            .sessions
            .remove_if(room_id, |_, s| s.status == CallStatus::Pending)?;
        self.release_pair(&session);
        Some(session)
    }

    /// Pending sessions in which `user_id` is either party.
    pub fn pending_for_user(&self, user_id: &str) -> Vec<CallSession> {
        self.sessions
            .iter()
            .filter(|s| s.status == CallStatus::Pending && s.involves(user_id))
            .map(|s| s.clone())
            .collect()
    }

    /// Accepted sessions in which `user_id` is either party.
    pub fn accepted_for_user(&self, user_id: &str) -> Vec<CallSession> {
        self.sessions
            .iter()
            .filter(|s| s.status == CallStatus::Accepted && s.involves(user_id))
            .map(|s| s.clone())
            .collect()
    }

    /// All retained sessions for a user, newest first.
    pub fn history_for_user(&self, user_id: &str, limit: usize) -> Vec<CallSession> {
        let mut history: Vec<CallSession> = self
            .sessions
            .iter()
            .filter(|s| s.involves(user_id))
            .map(|s| s.clone())
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history.truncate(limit);
        history
    }

    /// Periodic maintenance.
    ///
    /// Rejects pending sessions older than `ring_timeout_secs` (0 disables
    /// the server-side ring timeout) and returns them so the caller can
    /// notify both parties. Drops terminal sessions that ended more than
    /// `retention_secs` ago.
    pub fn expire(
        &self,
        now: DateTime<Utc>,
        ring_timeout_secs: i64,
        retention_secs: i64,
    ) -> Vec<CallSession> {
        let mut timed_out = Vec::new();

        if ring_timeout_secs > 0 {
            let stale: Vec<String> = self
                .sessions
                .iter()
                .filter(|s| {
                    s.status == CallStatus::Pending
                        && (now - s.created_at).num_seconds() >= ring_timeout_secs
                })
                .map(|s| s.room_id.clone())
                .collect();

            for room_id in stale {
                let rejected = self.sessions.get_mut(&room_id).and_then(|mut s| {
                    // Status may have moved on since the scan.
                    s.reject(now).ok().map(|_| s.clone())
                });
                if let Some(session) = rejected {
                    self.release_pair(&session);
                    timed_out.push(session);
                }
            }

            if !timed_out.is_empty() {
                tracing::info!(count = timed_out.len(), "Rejected unanswered calls");
            }
        }

        let before = self.sessions.len();
        self.sessions.retain(|_, s| {
            !(s.status.is_terminal()
                && s.ended_at
                    .map(|ended| (now - ended).num_seconds() > retention_secs)
                    .unwrap_or(false))
        });
        let dropped = before.saturating_sub(self.sessions.len());
        if dropped > 0 {
            tracing::debug!(count = dropped, "Dropped finished call sessions");
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active_pairs.len()
    }

    fn release_pair(&self, session: &CallSession) {
        self.active_pairs
            .remove_if(&session.pair_key(), |_, room_id| *room_id == session.room_id);
    }
}

fn check_caller(session: &CallSession, caller_user_id: &str) -> Result<()> {
    if session.caller_user_id == caller_user_id {
        Ok(())
    } else {
        Err(RelayError::Validation(format!(
            "'{}' is not the caller of '{}'",
            caller_user_id, session.room_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending(room: &str, caller: &str, callee: &str) -> CallSession {
        CallSession::new(room, caller, callee, CallKind::Generic, None, Utc::now())
    }

    #[test]
    fn test_legal_lifecycle() {
        let t0 = Utc::now();
        let mut s = CallSession::new("R1", "U1", "U2", CallKind::Generic, None, t0);
        assert_eq!(s.status, CallStatus::Pending);

        s.accept(t0 + Duration::seconds(5)).unwrap();
        assert_eq!(s.status, CallStatus::Accepted);
        assert!(s.accepted_at.is_some());

        s.end(t0 + Duration::seconds(65)).unwrap();
        assert_eq!(s.status, CallStatus::Ended);
        assert_eq!(s.duration_secs, Some(60));
    }

    #[test]
    fn test_cancel_while_pending_has_no_duration() {
        let mut s = pending("R1", "U1", "U2");
        s.end(Utc::now()).unwrap();
        assert_eq!(s.status, CallStatus::Ended);
        assert!(s.duration_secs.is_none());
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn test_no_transition_leaves_terminal_state() {
        let mut rejected = pending("R1", "U1", "U2");
        rejected.reject(Utc::now()).unwrap();

        let mut ended = pending("R2", "U1", "U2");
        ended.end(Utc::now()).unwrap();

        for s in [&mut rejected, &mut ended] {
            let before = s.clone();
            assert!(s.accept(Utc::now()).is_err());
            assert!(s.reject(Utc::now()).is_err());
            assert!(s.end(Utc::now()).is_err());
            assert_eq!(*s, before);
        }
    }

    #[test]
    fn test_reject_only_from_pending() {
        let mut s = pending("R1", "U1", "U2");
        s.accept(Utc::now()).unwrap();
        match s.reject(Utc::now()) {
            Err(RelayError::IllegalTransition { from, event, .. }) => {
                assert_eq!(from, CallStatus::Accepted);
                assert_eq!(event, "reject");
            }
            other => panic!("Expected IllegalTransition, got {:?}", other),
        }
    }

    #[test]
    fn test_registry_rejects_duplicate_room() {
        let calls = CallRegistry::new();
        calls.create(pending("R1", "U1", "U2")).unwrap();
        let err = calls.create(pending("R1", "U3", "U4")).unwrap_err();
        assert!(matches!(err, RelayError::RoomInUse(_)));
    }

    #[test]
    fn test_registry_one_active_call_per_pair() {
        let calls = CallRegistry::new();
        calls.create(pending("R1", "U1", "U2")).unwrap();

        // Same pair, either direction
        assert!(calls.create(pending("R2", "U2", "U1")).is_err());
        assert_eq!(calls.active_for_pair("U2", "U1").unwrap().room_id, "R1");

        calls.reject("R1", "U1").unwrap();
        assert!(calls.active_for_pair("U1", "U2").is_none());
        calls.create(pending("R2", "U2", "U1")).unwrap();
        assert_eq!(calls.active_count(), 1);
    }

    #[test]
    fn test_accept_requires_matching_caller() {
        let calls = CallRegistry::new();
        calls.create(pending("R1", "U1", "U2")).unwrap();

        assert!(matches!(
            calls.accept("R1", "U9"),
            Err(RelayError::Validation(_))
        ));
        assert_eq!(calls.get("R1").unwrap().status, CallStatus::Pending);

        let accepted = calls.accept("R1", "U1").unwrap();
        assert_eq!(accepted.status, CallStatus::Accepted);
        // Still the active call for the pair
        assert!(calls.active_for_pair("U1", "U2").is_some());
    }

    #[test]
    fn test_accept_after_end_is_illegal() {
        let calls = CallRegistry::new();
        calls.create(pending("R1", "U1", "U2")).unwrap();
        calls.end("R1", "U1").unwrap();

        assert!(matches!(
            calls.accept("R1", "U1"),
            Err(RelayError::IllegalTransition { .. })
        ));
        assert!(matches!(
            calls.accept("missing", "U1"),
            Err(RelayError::CallNotFound(_))
        ));
    }

    #[test]
    fn test_discard_frees_pair_and_room() {
        let calls = CallRegistry::new();
        calls.create(pending("R1", "U1", "U2")).unwrap();

        assert!(calls.discard("R1").is_some());
        assert!(calls.get("R1").is_none());
        assert_eq!(calls.active_count(), 0);
        calls.create(pending("R1", "U1", "U2")).unwrap();

        calls.accept("R1", "U1").unwrap();
        assert!(calls.discard("R1").is_none());
    }

    #[test]
    fn test_end_requires_party() {
        let calls = CallRegistry::new();
        calls.create(pending("R1", "U1", "U2")).unwrap();
        assert!(calls.end("R1", "U3").is_err());
        assert!(calls.end("R1", "U2").is_ok());
    }

    #[test]
    fn test_history_newest_first() {
        let calls = CallRegistry::new();
        let t0 = Utc::now();
        for (i, room) in ["R1", "R2", "R3"].iter().enumerate() {
            let s = CallSession::new(
                room,
                "U1",
                &format!("U{}", i + 2),
                CallKind::Generic,
                None,
                t0 + Duration::seconds(i as i64),
            );
            calls.create(s).unwrap();
        }

        let history = calls.history_for_user("U1", 2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].room_id, "R3");
        assert_eq!(history[1].room_id, "R2");
        assert_eq!(calls.history_for_user("U3", 10).len(), 1);
    }

    #[test]
    fn test_expire_ring_timeout() {
        let calls = CallRegistry::new();
        let t0 = Utc::now();
        calls
            .create(CallSession::new("R1", "U1", "U2", CallKind::Generic, None, t0))
            .unwrap();

        // Disabled
        assert!(calls.expire(t0 + Duration::seconds(120), 0, 3600).is_empty());
        // Not yet due
        assert!(calls.expire(t0 + Duration::seconds(10), 30, 3600).is_empty());

        let timed_out = calls.expire(t0 + Duration::seconds(31), 30, 3600);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].status, CallStatus::Rejected);
        assert!(calls.active_for_pair("U1", "U2").is_none());
    }

    #[test]
    fn test_expire_drops_old_terminal_sessions() {
        let calls = CallRegistry::new();
        calls.create(pending("R1", "U1", "U2")).unwrap();
        calls.create(pending("R2", "U3", "U4")).unwrap();
        calls.end("R1", "U1").unwrap();

        let later = Utc::now() + Duration::seconds(7200);
        calls.expire(later, 0, 3600);
        assert!(calls.get("R1").is_none());
        // Active sessions are never garbage-collected
        assert!(calls.get("R2").is_some());
    }
}
