//! Core domain types.
//!
//! Identifiers and match records shared by every other module.
//! Nothing in here performs I/O.

pub mod identity;
pub mod record;

// Re-export core types
pub use identity::{ConnectionId, Identity, RoomId, Role};
pub use record::{MatchOutcome, MatchRecord, PersonalResult, ReportedOutcome};
