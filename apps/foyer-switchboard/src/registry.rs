//! In-memory room membership, shared across every websocket connection.
//!
//! Rooms exist exactly as long as they have members: the first join creates
//! a room, the last departure deletes it. Members are kept in arrival order
//! so join acknowledgements list longer-standing members first.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

/// One user's seat in a room, keyed to the websocket connection that
/// currently speaks for them.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub connection_id: String,
    pub user_id: String,
    pub display_name: String,
}

/// What a join observed: whether it created the room, and who was already
/// there (never including the joiner itself).
#[derive(Debug, PartialEq)]
pub struct JoinOutcome {
    pub created_room: bool,
    pub existing: Vec<Member>,
}

/// A membership lost when a connection went away.
#[derive(Debug, Clone)]
pub struct Departure {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum JoinError {
    #[error("userId must not be empty")]
    EmptyUserId,
}

#[derive(Debug, Default)]
struct Room {
    members: Vec<Member>,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user to a room, creating the room on first join. Joining a room
    /// the user is already in replaces their previous registration in place,
    /// so a reconnecting client silently displaces its dead predecessor.
    pub fn join(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: &str,
        display_name: &str,
    ) -> Result<JoinOutcome, JoinError> {
        if user_id.is_empty() {
            return Err(JoinError::EmptyUserId);
        }
        let mut room = self.rooms.entry(room_id.to_string()).or_default();
        let member = Member {
            connection_id: connection_id.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        };
        let existing: Vec<Member> = room
            .members
            .iter()
            .filter(|m| m.user_id != user_id)
            .cloned()
            .collect();
        let created_room = room.members.is_empty();
        match room.members.iter_mut().find(|m| m.user_id == user_id) {
            Some(slot) => *slot = member,
            None => room.members.push(member),
        }
        Ok(JoinOutcome {
            created_room,
            existing,
        })
    }

    /// Remove a user from a room. Returns false when the room or membership
    /// does not exist, so repeated leaves are harmless.
    pub fn leave(&self, room_id: &str, user_id: &str) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                let before = room.members.len();
                room.members.retain(|m| m.user_id != user_id);
                room.members.len() < before
            }
            None => return false,
        };
        // The guard above is dropped before this; empty rooms vanish at once.
        self.rooms.remove_if(room_id, |_, room| room.members.is_empty());
        removed
    }

    /// Drop every membership held by a connection. Used when a socket closes
    /// or times out; the caller broadcasts the resulting departures.
    pub fn remove_by_connection(&self, connection_id: &str) -> Vec<Departure> {
        let mut departures = Vec::new();
        for mut entry in self.rooms.iter_mut() {
            let room_id = entry.key().clone();
            entry.value_mut().members.retain(|m| {
                if m.connection_id == connection_id {
                    departures.push(Departure {
                        room_id: room_id.clone(),
                        user_id: m.user_id.clone(),
                    });
                    false
                } else {
                    true
                }
            });
        }
        self.rooms.retain(|_, room| !room.members.is_empty());
        departures
    }

    pub fn members(&self, room_id: &str) -> Vec<Member> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    pub fn member_in_room(&self, room_id: &str, user_id: &str) -> Option<Member> {
        self.rooms
            .get(room_id)?
            .members
            .iter()
            .find(|m| m.user_id == user_id)
            .cloned()
    }

    /// Locate a user for signal routing: their claimed room first, then any
    /// room. A stale roomId on an envelope must not hide a live target.
    pub fn find_member(&self, room_id: &str, user_id: &str) -> Option<Member> {
        if let Some(member) = self.member_in_room(room_id, user_id) {
            return Some(member);
        }
        self.rooms.iter().find_map(|entry| {
            entry
                .value()
                .members
                .iter()
                .find(|m| m.user_id == user_id)
                .cloned()
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::deadline]
    fn first_join_creates_room() {
        let registry = RoomRegistry::new();
        let outcome = registry.join("r1", "alice", "c1", "Alice").unwrap();
        assert!(outcome.created_room);
        assert!(outcome.existing.is_empty());
        assert_eq!(registry.room_count(), 1);
    }

    #[test_deadline::deadline]
    fn later_joins_see_existing_members_in_arrival_order() {
        let registry = RoomRegistry::new();
        registry.join("r1", "alice", "c1", "Alice").unwrap();
        registry.join("r1", "bob", "c2", "Bob").unwrap();
        let outcome = registry.join("r1", "carol", "c3", "Carol").unwrap();
        assert!(!outcome.created_room);
        let ids: Vec<&str> = outcome.existing.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
    }

    #[test_deadline::deadline]
    fn rejoin_replaces_connection_and_keeps_slot() {
        let registry = RoomRegistry::new();
        registry.join("r1", "alice", "c1", "Alice").unwrap();
        registry.join("r1", "bob", "c2", "Bob").unwrap();
        let outcome = registry.join("r1", "alice", "c9", "Alice II").unwrap();
        assert!(!outcome.created_room);
        // The rejoining user never appears in its own existing list.
        assert_eq!(outcome.existing.len(), 1);
        assert_eq!(outcome.existing[0].user_id, "bob");
        let members = registry.members("r1");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].user_id, "alice");
        assert_eq!(members[0].connection_id, "c9");
        assert_eq!(members[0].display_name, "Alice II");
    }

    #[test_deadline::deadline]
    fn empty_user_id_is_rejected() {
        let registry = RoomRegistry::new();
        assert_eq!(
            registry.join("r1", "", "c1", "Nobody"),
            Err(JoinError::EmptyUserId)
        );
        assert_eq!(registry.room_count(), 0);
    }

    #[test_deadline::deadline]
    fn last_leave_deletes_room() {
        let registry = RoomRegistry::new();
        registry.join("r1", "alice", "c1", "Alice").unwrap();
        registry.join("r1", "bob", "c2", "Bob").unwrap();
        assert!(registry.leave("r1", "alice"));
        assert_eq!(registry.room_count(), 1);
        assert!(registry.leave("r1", "bob"));
        assert_eq!(registry.room_count(), 0);
    }

    #[test_deadline::deadline]
    fn leave_is_idempotent() {
        let registry = RoomRegistry::new();
        registry.join("r1", "alice", "c1", "Alice").unwrap();
        assert!(registry.leave("r1", "alice"));
        assert!(!registry.leave("r1", "alice"));
        assert!(!registry.leave("nowhere", "alice"));
    }

    #[test_deadline::deadline]
    fn remove_by_connection_reports_each_departure() {
        let registry = RoomRegistry::new();
        registry.join("r1", "alice", "c1", "Alice").unwrap();
        registry.join("r2", "alice-b", "c1", "Alice").unwrap();
        registry.join("r1", "bob", "c2", "Bob").unwrap();
        let mut departures = registry.remove_by_connection("c1");
        departures.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        assert_eq!(departures.len(), 2);
        assert_eq!(departures[0].room_id, "r1");
        assert_eq!(departures[0].user_id, "alice");
        assert_eq!(departures[1].room_id, "r2");
        // r2 emptied out and was deleted, r1 still holds bob.
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.members("r1").len(), 1);
    }

    #[test_deadline::deadline]
    fn find_member_prefers_claimed_room_then_scans() {
        let registry = RoomRegistry::new();
        registry.join("r1", "alice", "c1", "Alice").unwrap();
        registry.join("r2", "bob", "c2", "Bob").unwrap();
        let hit = registry.find_member("r1", "alice").unwrap();
        assert_eq!(hit.connection_id, "c1");
        // Wrong room hint still finds the user.
        let scanned = registry.find_member("r1", "bob").unwrap();
        assert_eq!(scanned.connection_id, "c2");
        assert!(registry.find_member("r1", "carol").is_none());
    }
}
