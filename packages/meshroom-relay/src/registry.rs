//! Room membership bookkeeping.
//!
//! `RoomRegistry` is a plain state machine with no I/O. `RelayState` keeps it
//! behind a single lock so that a join, the notifications it produces, and
//! any concurrent leave are observed in one order by every session.

use std::collections::HashMap;

use crate::protocol::{RoomId, SessionId};

/// Default maximum members per room.
pub const DEFAULT_MAX_ROOM_MEMBERS: usize = 50;

/// Reasons a join is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Session '{0}' is not connected")]
    NotConnected(SessionId),

    #[error("Room id must not be empty")]
    EmptyRoomId,

    #[error("Room '{room_id}' is full ({max} members)")]
    RoomFull { room_id: RoomId, max: usize },
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_id: RoomId,
    /// Members present before this session was added, in join order.
    pub existing: Vec<SessionId>,
    /// Set when the session was moved out of another room by this join.
    pub left: Option<LeaveOutcome>,
    /// The session was already a member; nothing changed.
    pub already_member: bool,
}

/// Result of removing a session from a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    /// Members still in the room, in join order.
    pub remaining: Vec<SessionId>,
    pub room_closed: bool,
}

/// Room id → members, plus the reverse index session → room.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Vec<SessionId>>,
    memberships: HashMap<SessionId, RoomId>,
    max_room_members: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROOM_MEMBERS)
    }
}

impl RoomRegistry {
    pub fn new(max_room_members: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            max_room_members: max_room_members.max(1),
        }
    }

    /// Add `session_id` to `room_id`, creating the room if absent.
    ///
    /// A session is in at most one room: joining a different room first
    /// leaves the current one, reported through [`JoinOutcome::left`].
    /// Capacity is checked before anything is mutated.
    pub fn join(&mut self, session_id: &str, room_id: &str) -> Result<JoinOutcome, RoomError> {
        if room_id.is_empty() {
            return Err(RoomError::EmptyRoomId);
        }

        if self.memberships.get(session_id).map(String::as_str) == Some(room_id) {
            let existing = self
                .members(room_id)
                .into_iter()
                .filter(|m| m != session_id)
                .collect();
            return Ok(JoinOutcome {
                room_id: room_id.to_string(),
                existing,
                left: None,
                already_member: true,
            });
        }

        let current = self.rooms.get(room_id).map(Vec::len).unwrap_or(0);
        if current >= self.max_room_members {
            return Err(RoomError::RoomFull {
                room_id: room_id.to_string(),
                max: self.max_room_members,
            });
        }

        let left = self
            .memberships
            .get(session_id)
            .cloned()
            .and_then(|previous| self.leave(session_id, &previous));

        let members = self.rooms.entry(room_id.to_string()).or_default();
        let existing = members.clone();
        members.push(session_id.to_string());
        self.memberships
            .insert(session_id.to_string(), room_id.to_string());

        Ok(JoinOutcome {
            room_id: room_id.to_string(),
            existing,
            left,
            already_member: false,
        })
    }

    /// Remove `session_id` from `room_id`. Returns `None` if it was not a member.
    pub fn leave(&mut self, session_id: &str, room_id: &str) -> Option<LeaveOutcome> {
        if self.memberships.get(session_id).map(String::as_str) != Some(room_id) {
            return None;
        }
        self.memberships.remove(session_id);

        let members = self.rooms.get_mut(room_id)?;
        members.retain(|m| m != session_id);
        let remaining = members.clone();

        let room_closed = remaining.is_empty();
        if room_closed {
            self.rooms.remove(room_id);
        }

        Some(LeaveOutcome {
            room_id: room_id.to_string(),
            remaining,
            room_closed,
        })
    }

    /// Remove `session_id` from whatever room it is in.
    pub fn disconnect(&mut self, session_id: &str) -> Option<LeaveOutcome> {
        let room_id = self.memberships.get(session_id)?.clone();
        self.leave(session_id, &room_id)
    }

    pub fn room_of(&self, session_id: &str) -> Option<&str> {
        self.memberships.get(session_id).map(String::as_str)
    }

    /// True if both sessions are currently members of the same room.
    pub fn share_room(&self, a: &str, b: &str) -> bool {
        match (self.memberships.get(a), self.memberships.get(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    pub fn members(&self, room_id: &str) -> Vec<SessionId> {
        self.rooms.get(room_id).cloned().unwrap_or_default()
    }

    pub fn member_count(&self, room_id: &str) -> Option<usize> {
        self.rooms.get(room_id).map(Vec::len)
    }

    /// Snapshot of room id → member count.
    pub fn room_counts(&self) -> HashMap<RoomId, usize> {
        self.rooms
            .iter()
            .map(|(id, members)| (id.clone(), members.len()))
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total memberships across all rooms.
    pub fn member_total(&self) -> usize {
        self.memberships.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_join_creates_room() {
        let mut reg = RoomRegistry::default();
        let outcome = reg.join("a", "R1").unwrap();
        assert!(outcome.existing.is_empty());
        assert!(!outcome.already_member);
        assert_eq!(reg.member_count("R1"), Some(1));
        assert_eq!(reg.room_of("a"), Some("R1"));
    }

    #[test]
    fn test_join_returns_members_before_addition() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        let b = reg.join("b", "R1").unwrap();
        assert_eq!(b.existing, vec!["a".to_string()]);
        let c = reg.join("c", "R1").unwrap();
        assert_eq!(c.existing, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reg.members("R1"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rejoin_same_room_is_noop() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        reg.join("b", "R1").unwrap();
        let again = reg.join("b", "R1").unwrap();
        assert!(again.already_member);
        assert_eq!(again.existing, vec!["a".to_string()]);
        assert_eq!(reg.member_count("R1"), Some(2));
    }

    #[test]
    fn test_join_other_room_leaves_previous() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        reg.join("b", "R1").unwrap();
        let moved = reg.join("b", "R2").unwrap();
        let left = moved.left.expect("previous room should be left");
        assert_eq!(left.room_id, "R1");
        assert_eq!(left.remaining, vec!["a".to_string()]);
        assert!(!left.room_closed);
        assert_eq!(reg.room_of("b"), Some("R2"));
        assert_eq!(reg.members("R1"), vec!["a"]);
    }

    #[test]
    fn test_leave_removes_empty_room() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        let outcome = reg.leave("a", "R1").unwrap();
        assert!(outcome.room_closed);
        assert_eq!(reg.member_count("R1"), None);
        assert_eq!(reg.room_count(), 0);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        reg.join("b", "R1").unwrap();
        assert!(reg.leave("b", "R1").is_some());
        assert!(reg.leave("b", "R1").is_none());
        assert!(reg.leave("b", "nowhere").is_none());
        assert_eq!(reg.member_count("R1"), Some(1));
    }

    #[test]
    fn test_leave_wrong_room_is_noop() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        assert!(reg.leave("a", "R2").is_none());
        assert_eq!(reg.room_of("a"), Some("R1"));
    }

    #[test]
    fn test_disconnect_leaves_current_room() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        reg.join("b", "R1").unwrap();
        let outcome = reg.disconnect("a").unwrap();
        assert_eq!(outcome.remaining, vec!["b".to_string()]);
        assert!(reg.disconnect("a").is_none());
    }

    #[test]
    fn test_room_full_rejects_without_mutation() {
        let mut reg = RoomRegistry::new(2);
        reg.join("a", "R1").unwrap();
        reg.join("b", "R1").unwrap();
        reg.join("c", "R2").unwrap();
        let err = reg.join("c", "R1").unwrap_err();
        assert_eq!(
            err,
            RoomError::RoomFull {
                room_id: "R1".to_string(),
                max: 2
            }
        );
        // c stays where it was
        assert_eq!(reg.room_of("c"), Some("R2"));
        assert_eq!(reg.member_count("R1"), Some(2));
    }

    #[test]
    fn test_empty_room_id_rejected() {
        let mut reg = RoomRegistry::default();
        assert_eq!(reg.join("a", "").unwrap_err(), RoomError::EmptyRoomId);
    }

    #[test]
    fn test_share_room() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        reg.join("b", "R1").unwrap();
        reg.join("c", "R2").unwrap();
        assert!(reg.share_room("a", "b"));
        assert!(!reg.share_room("a", "c"));
        assert!(!reg.share_room("a", "ghost"));
    }

    #[test]
    fn test_room_counts_snapshot() {
        let mut reg = RoomRegistry::default();
        reg.join("a", "R1").unwrap();
        reg.join("b", "R1").unwrap();
        reg.join("c", "R2").unwrap();
        let counts = reg.room_counts();
        assert_eq!(counts.get("R1"), Some(&2));
        assert_eq!(counts.get("R2"), Some(&1));
        assert_eq!(reg.member_total(), 3);
    }
}
