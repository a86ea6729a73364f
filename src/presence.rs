//! Presence registry: which connection a user is currently reachable on.
//!
//! At most one connection per user. A later registration overwrites the
//! earlier one (a user opening a second tab or reconnecting). Release is by
//! value, so a stale connection closing never evicts a newer registration.

use std::sync::Arc;

use dashmap::DashMap;

use crate::state::ConnectionId;

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    /// User ID → connection ID.
    entries: Arc<DashMap<String, ConnectionId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `connection_id`, replacing any previous binding.
    /// Returns false (and does nothing) for an empty user id.
    pub fn register(&self, user_id: &str, connection_id: &str) -> bool {
        if user_id.trim().is_empty() {
            return false;
        }

        if let Some(previous) = self
            .entries
            .insert(user_id.to_string(), connection_id.to_string())
        {
            if previous != connection_id {
                tracing::debug!(
                    user = user_id,
                    previous = previous.as_str(),
                    conn = connection_id,
                    "Presence moved to newer connection"
                );
            }
        }
        true
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.entries.get(user_id).map(|entry| entry.value().clone())
    }

    /// Remove every entry pointing at `connection_id`. Returns the user ids
    /// that lost their presence. Safe to call when nothing matches.
    pub fn release(&self, connection_id: &str) -> Vec<String> {
        let users: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value() == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = Vec::with_capacity(users.len());
        for user_id in users {
            // Re-check under the shard lock: the user may have re-registered
            // on another connection since the scan.
            if self
                .entries
                .remove_if(&user_id, |_, conn| conn == connection_id)
                .is_some()
            {
                released.push(user_id);
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, for the debug endpoint.
    pub fn snapshot(&self) -> Vec<(String, ConnectionId)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
