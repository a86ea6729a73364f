//! Room membership: which connections are joined to which room.
//!
//! Membership only scopes delivery. Rooms are sets, so a duplicate join is
//! a no-op, and a room disappears when its last member leaves.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::state::ConnectionId;

/// Result of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// False when the connection was already a member.
    pub newly_joined: bool,
    /// Members other than the joiner, as of the join.
    pub others: Vec<ConnectionId>,
}

#[derive(Clone, Default)]
pub struct RoomMembership {
    /// Room ID → member connections.
    rooms: Arc<DashMap<String, HashSet<ConnectionId>>>,
    /// Connection ID → rooms it joined. Used to prune on disconnect.
    by_connection: Arc<DashMap<ConnectionId, HashSet<String>>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, connection_id: &str, room_id: &str) -> JoinOutcome {
        let (newly_joined, others) = {
            let mut members = self.rooms.entry(room_id.to_string()).or_default();
            let newly_joined = members.insert(connection_id.to_string());
            let others = members
                .iter()
                .filter(|member| member.as_str() != connection_id)
                .cloned()
                .collect::<Vec<_>>();
            (newly_joined, others)
        };

        self.by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(room_id.to_string());

        if newly_joined {
            tracing::debug!(
                conn = connection_id,
                room_id = room_id,
                members = others.len() + 1,
                "Connection joined room"
            );
        }

        JoinOutcome {
            newly_joined,
            others,
        }
    }

    /// Remove a connection from one room. Returns the remaining members, or
    /// `None` if the connection was not a member.
    pub fn leave(&self, connection_id: &str, room_id: &str) -> Option<Vec<ConnectionId>> {
        let remaining = {
            let mut members = self.rooms.get_mut(room_id)?;
            if !members.remove(connection_id) {
                return None;
            }
            members.iter().cloned().collect::<Vec<_>>()
        };

        if remaining.is_empty() {
            self.rooms.remove_if(room_id, |_, members| members.is_empty());
            tracing::debug!(room_id = room_id, "Removed empty room");
        }

        if let Some(mut rooms) = self.by_connection.get_mut(connection_id) {
            rooms.remove(room_id);
        }
        self.by_connection
            .remove_if(connection_id, |_, rooms| rooms.is_empty());

        Some(remaining)
    }

    /// Drop a connection from every room it joined.
    /// Returns room ID → remaining members for each affected room.
    pub fn remove_connection(&self, connection_id: &str) -> Vec<(String, Vec<ConnectionId>)> {
        let rooms = match self.by_connection.remove(connection_id) {
            Some((_, rooms)) => rooms,
            None => return Vec::new(),
        };

        let mut affected = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            let remaining = match self.rooms.get_mut(&room_id) {
                Some(mut members) => {
                    members.remove(connection_id);
                    members.iter().cloned().collect::<Vec<_>>()
                }
                None => continue,
            };
            if remaining.is_empty() {
                self.rooms.remove_if(&room_id, |_, members| members.is_empty());
            }
            affected.push((room_id, remaining));
        }
        affected
    }

    /// Every member of `room_id` except `exclude`.
    pub fn members_except(&self, room_id: &str, exclude: Option<&str>) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|member| Some(member.as_str()) != exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_member(&self, room_id: &str, connection_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn test_join_reports_existing_members() {
        let rooms = RoomMembership::new();

        let first = rooms.join("C1", "R1");
        assert!(first.newly_joined);
        assert!(first.others.is_empty());

        let second = rooms.join("C2", "R1");
        assert!(second.newly_joined);
        assert_eq!(second.others, vec!["C1".to_string()]);
    }

    #[test]
    fn test_duplicate_join_is_noop() {
        let rooms = RoomMembership::new();
        rooms.join("C1", "R1");
        rooms.join("C2", "R1");

        let again = rooms.join("C2", "R1");
        assert!(!again.newly_joined);
        assert_eq!(sorted(rooms.members_except("R1", None)), vec!["C1", "C2"]);
    }

    #[test]
    fn test_members_except_excludes_sender() {
        let rooms = RoomMembership::new();
        rooms.join("A", "R1");
        rooms.join("B", "R1");
        rooms.join("C", "R1");

        assert_eq!(sorted(rooms.members_except("R1", Some("A"))), vec!["B", "C"]);
        assert!(rooms.members_except("missing", Some("A")).is_empty());
    }

    #[test]
    fn test_leave_removes_empty_room() {
        let rooms = RoomMembership::new();
        rooms.join("C1", "R1");
        rooms.join("C2", "R1");

        assert_eq!(rooms.leave("C1", "R1"), Some(vec!["C2".to_string()]));
        assert_eq!(rooms.leave("C2", "R1"), Some(Vec::new()));
        assert_eq!(rooms.room_count(), 0);
        assert!(rooms.leave("C2", "R1").is_none());
    }

    #[test]
    fn test_remove_connection_prunes_all_rooms() {
        let rooms = RoomMembership::new();
        rooms.join("C1", "R1");
        rooms.join("C1", "R2");
        rooms.join("C2", "R1");

        let affected = rooms.remove_connection("C1");
        assert_eq!(affected.len(), 2);
        assert!(!rooms.is_member("R1", "C1"));
        assert!(rooms.is_member("R1", "C2"));
        // R2 had only C1
        assert_eq!(rooms.room_count(), 1);

        assert!(rooms.remove_connection("C1").is_empty());
    }
}
