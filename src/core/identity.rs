//! Identifiers
//!
//! Player identities, connection ids and room ids.
//! Ord is derived everywhere so the types can key BTreeMaps.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTITY
// =============================================================================

/// Stable handle of a registered player.
///
/// Sourced from the account store; opaque beyond equality and ordering.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap a player handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Borrow the handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for an empty handle, which is never a valid identity.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// CONNECTION ID
// =============================================================================

/// Unique id of one live network connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// ROOM ID
// =============================================================================

/// Room identifier, derived from the two connection ids in seat order.
///
/// Connection ids are never reused, so each pairing gets a distinct id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Derive the id for a (white, black) pairing.
    pub fn from_pair(white: ConnectionId, black: ConnectionId) -> Self {
        Self(format!("{}-{}", white, black))
    }

    /// Borrow as string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// ROLE
// =============================================================================

/// Seat within a room. Fixed at pairing time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// First seat: the player who was waiting.
    White,
    /// Second seat: the player whose arrival completed the pair.
    Black,
}

impl Role {
    /// The other seat.
    pub fn opposite(self) -> Self {
        match self {
            Role::White => Role::Black,
            Role::Black => Role::White,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_is_seat_ordered() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        let ab = RoomId::from_pair(a, b);
        let ba = RoomId::from_pair(b, a);

        assert_ne!(ab, ba);
        assert!(ab.as_str().starts_with(&a.to_string()));
        assert!(ab.as_str().ends_with(&b.to_string()));
    }

    #[test]
    fn test_identity_serializes_as_plain_string() {
        let id = Identity::new("alice");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alice\"");
    }

    #[test]
    fn test_role_opposite() {
        assert_eq!(Role::White.opposite(), Role::Black);
        assert_eq!(Role::Black.opposite(), Role::White);
    }

    #[test]
    fn test_connection_ids_unique() {
        let ids: std::collections::BTreeSet<_> = (0..64).map(|_| ConnectionId::new()).collect();
        assert_eq!(ids.len(), 64);
    }
}
