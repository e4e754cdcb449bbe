//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON objects tagged by `type`. Move payloads are
//! relayed untouched; the server never interprets squares.

use serde::{Deserialize, Serialize};

use crate::core::{Identity, PersonalResult, ReportedOutcome, Role, RoomId};
use crate::rating::RatingChange;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate, for clients that could not present a token during the
    /// WebSocket handshake.
    Auth(AuthRequest),

    /// A move to forward to the opponent.
    Move(MovePayload),

    /// Chat line for the opponent.
    Chat { text: String },

    /// The game reached a terminal state.
    GameOver { outcome: ReportedOutcome },

    /// Enter the pairing queue again after a finished game.
    FindMatch,

    /// Leave the pairing queue.
    CancelMatchmaking,

    /// Rating and match history for a player (own identity if omitted).
    Profile {
        #[serde(default)]
        identity: Option<Identity>,
    },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Leave the queue and resign any active room.
    Leave,
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Identity token.
    pub token: String,
    /// Client version, informational.
    #[serde(default)]
    pub client_version: Option<String>,
}

/// A move, as produced by the client's board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    /// Square the piece leaves.
    pub source_square: String,
    /// Square the piece lands on.
    pub target_square: String,
    /// Anything else the clients agree on (promotion piece, clocks, ...).
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MovePayload {
    /// Move with no extra fields.
    pub fn new(source_square: impl Into<String>, target_square: impl Into<String>) -> Self {
        Self {
            source_square: source_square.into(),
            target_square: target_square.into(),
            extra: serde_json::Map::new(),
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Seated in the waiting slot.
    Waiting,

    /// Paired with an opponent.
    Paired(PairedInfo),

    /// Opponent's move.
    Move(MovePayload),

    /// Opponent's chat line.
    Chat {
        sender_role: Role,
        sender: Identity,
        text: String,
    },

    /// The room concluded.
    MatchEnd(MatchEndInfo),

    /// Persisted rating change after a match.
    RatingUpdate(RatingChange),

    /// Opponent's connection dropped; the room may forfeit.
    OpponentDisconnected {
        /// Seconds until forfeit, if forfeiture is enabled.
        forfeit_in_secs: Option<u64>,
    },

    /// Matchmaking status update.
    Matchmaking(MatchmakingResponse),

    /// Profile lookup result.
    Profile(ProfileInfo),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Resolved identity.
    pub identity: Option<Identity>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Pairing success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedInfo {
    /// Room identifier.
    pub room_id: RoomId,
    /// Seat assigned to the recipient.
    pub role: Role,
    /// The other member.
    pub opponent: Identity,
}

/// How a room ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A member reported the game over.
    Reported,
    /// A member stayed disconnected past the forfeit timeout.
    Forfeit,
}

/// Room conclusion notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEndInfo {
    /// Room identifier.
    pub room_id: RoomId,
    /// Winner, None on a draw.
    pub winner: Option<Identity>,
    /// Result from the recipient's side.
    pub result: PersonalResult,
    /// Why the room ended.
    pub reason: EndReason,
}

/// Matchmaking status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakingResponse {
    /// Current status.
    pub status: MatchmakingStatus,
}

/// Matchmaking status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchmakingStatus {
    /// Cancelled by player.
    Cancelled,
    /// Another connection with the same identity took the waiting slot.
    Superseded,
}

/// Profile lookup result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    /// Player.
    pub identity: Identity,
    /// Current rating.
    pub rating: i32,
    /// Matches, newest first.
    pub matches: Vec<MatchSummary>,
}

/// One match in a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    /// Opponent.
    pub opponent: Identity,
    /// Result for the profile owner.
    pub result: PersonalResult,
    /// Unix seconds.
    pub played_at: i64,
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed (connection will close).
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// Already authenticated.
    AlreadyAuthenticated,
    /// Invalid input.
    InvalidInput,
    /// Already in an active match.
    AlreadyInMatch,
    /// Not in an active match.
    NotInMatch,
    /// Reported winner is not a member of the room.
    InvalidOutcome,
    /// Player not found.
    NotFound,
    /// Server overloaded.
    ServerOverloaded,
    /// Connection was idle too long.
    IdleTimeout,
    /// Internal error.
    InternalError,
}

impl ServerMessage {
    /// Build an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }

    /// Whether the connection is closed after this message is written.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ServerMessage::Shutdown { .. }
                | ServerMessage::Error(ServerError {
                    code: ErrorCode::AuthFailed
                        | ErrorCode::ServerOverloaded
                        | ErrorCode::IdleTimeout,
                    ..
                })
        )
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Deserialize from a binary frame carrying UTF-8 JSON.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
