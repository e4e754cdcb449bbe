//! # Duel Relay Server
//!
//! Real-time 1v1 pairing and relay for turn-based games, with a fixed-K
//! rating ledger.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DUEL RELAY SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared vocabulary                         │
//! │  ├── identity.rs - Identity, ConnectionId, RoomId, Role      │
//! │  └── record.rs   - Outcomes and match records                │
//! │                                                              │
//! │  rating/         - Ratings                                   │
//! │  ├── adjust.rs   - Fixed-K deltas                            │
//! │  └── ledger.rs   - Single-writer persistence actor           │
//! │                                                              │
//! │  store/          - Account store                             │
//! │  ├── mod.rs      - UserStore trait                           │
//! │  └── memory.rs   - In-process implementation                 │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── auth.rs     - Token to identity                         │
//! │  ├── registry.rs - Live connections                          │
//! │  ├── pairing.rs  - Single-slot matchmaking actor             │
//! │  ├── session.rs  - Rooms and relay                           │
//! │  ├── protocol.rs - Message types                             │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Serialization Points
//!
//! Two pieces of state are owned by a single task and only changed through
//! its channel:
//! - the waiting slot (`PairingQueue`), so arrivals and removals never race
//! - rating writes (`RatingLedger`), so concurrent results touching one
//!   player never lose an increment
//!
//! The server never checks move legality. Clients are trusted to relay
//! legal moves and report the result.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod rating;
pub mod store;

// Re-export commonly used types
pub use core::{ConnectionId, Identity, MatchOutcome, MatchRecord, ReportedOutcome, Role, RoomId};
pub use network::{GameServer, IdentityResolver, PairingQueue, RoomManager, ServerConfig};
pub use rating::{RatingLedger, INITIAL_RATING, K_FACTOR};
pub use store::{MemoryUserStore, UserRecord, UserStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
