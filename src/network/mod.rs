//! Network Layer
//!
//! WebSocket server, identity resolution, pairing and room relay.
//!
//! - `auth`: token to identity
//! - `registry`: live connections
//! - `pairing`: single-slot matchmaking actor
//! - `session`: rooms, relay and conclusion
//! - `server`: accept loop and message dispatch

pub mod auth;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod server;

pub use auth::{issue_token, validate_token, AuthConfig, AuthError, IdentityResolver, TokenClaims};
pub use pairing::{Arrival, PairingError, PairingQueue, WaitingSlot};
pub use protocol::{ClientMessage, ErrorCode, MovePayload, ServerMessage};
pub use registry::{ConnectionRegistry, RegistryError};
pub use session::{Conclusion, Room, RoomConfig, RoomError, RoomManager, RoomState};
pub use server::{GameServer, GameServerError, ServerConfig};
