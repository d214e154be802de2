//! Room keys, connection ids and the two-seat room.

use super::BrokerError;
use crate::core::config::{ROOM_CAPACITY, ROOM_KEY_LEN};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized room key: exactly 8 ASCII alphanumerics, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Trim, lowercase and validate a user-supplied key.
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        let key = raw.trim().to_ascii_lowercase();
        if key.len() != ROOM_KEY_LEN || !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(BrokerError::Validation(format!(
                "room key must be exactly {ROOM_KEY_LEN} alphanumeric characters"
            )));
        }
        Ok(Self(key))
    }

    /// Fresh random key for a room creator.
    pub fn generate() -> Self {
        let key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ROOM_KEY_LEN)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect();
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-connection id handed to peers in `peer-joined` / `signal`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// At most [`ROOM_CAPACITY`] participants, in join order.
#[derive(Debug, Default)]
pub struct Room {
    participants: Vec<ConnectionId>,
}

impl Room {
    pub fn with_creator(conn: ConnectionId) -> Self {
        Self {
            participants: vec![conn],
        }
    }

    pub fn contains(&self, conn: &ConnectionId) -> bool {
        self.participants.contains(conn)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= ROOM_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participants(&self) -> &[ConnectionId] {
        &self.participants
    }

    pub fn add(&mut self, conn: ConnectionId) -> Result<(), BrokerError> {
        if self.contains(&conn) {
            return Ok(());
        }
        if self.is_full() {
            return Err(BrokerError::Capacity);
        }
        self.participants.push(conn);
        Ok(())
    }

    pub fn remove(&mut self, conn: &ConnectionId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|c| c != conn);
        self.participants.len() != before
    }

    /// Everyone in the room except `conn`.
    pub fn others<'a>(&'a self, conn: &'a ConnectionId) -> impl Iterator<Item = &'a ConnectionId> {
        self.participants.iter().filter(move |c| *c != conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        assert_eq!(RoomKey::parse("  AbCd1234 ").unwrap().as_str(), "abcd1234");
    }

    #[test]
    fn test_parse_rejects_bad_keys() {
        for bad in ["abc", "toolongkey123", "ab!@#$%", "", "abcd 123", "ÀÀÀÀÀÀÀÀ"] {
            assert!(
                matches!(RoomKey::parse(bad), Err(BrokerError::Validation(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_generated_keys_are_valid() {
        for _ in 0..100 {
            let key = RoomKey::generate();
            assert_eq!(RoomKey::parse(key.as_str()).unwrap(), key);
        }
    }

    #[test]
    fn test_room_capacity() {
        let a = ConnectionId::from("a");
        let mut room = Room::with_creator(a.clone());
        room.add("b".into()).unwrap();
        assert!(matches!(room.add("c".into()), Err(BrokerError::Capacity)));
        // Re-adding a member is a no-op.
        room.add(a.clone()).unwrap();
        assert_eq!(room.participants().len(), 2);
        assert_eq!(room.others(&a).collect::<Vec<_>>(), vec![&ConnectionId::from("b")]);
    }
}
