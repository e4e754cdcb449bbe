//! Account Store
//!
//! Interface to the external key-value store of user records and match
//! history. The server only ever talks to it through [`UserStore`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Identity, MatchRecord};

pub use memory::MemoryUserStore;

/// A registered player as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Player handle.
    pub identity: Identity,
    /// Current rating.
    pub rating: i32,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// New record at the given starting rating.
    pub fn new(identity: Identity, rating: i32) -> Self {
        Self {
            identity,
            rating,
            created_at: Utc::now(),
        }
    }
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record for this identity.
    #[error("user not found: {0}")]
    NotFound(Identity),
    /// Identity already registered.
    #[error("user already exists: {0}")]
    AlreadyExists(Identity),
    /// Backend unreachable or failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Account and match-history operations consumed by the server.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Register a new player.
    async fn create_user(&self, user: UserRecord) -> Result<(), StoreError>;

    /// Fetch a player's record.
    async fn get_user(&self, identity: &Identity) -> Result<UserRecord, StoreError>;

    /// Fetch a player's rating.
    async fn get_rating(&self, identity: &Identity) -> Result<i32, StoreError> {
        Ok(self.get_user(identity).await?.rating)
    }

    /// Add `delta` to a player's rating.
    async fn adjust_rating(&self, identity: &Identity, delta: i32) -> Result<(), StoreError>;

    /// Append a match record.
    async fn append_match_record(&self, record: MatchRecord) -> Result<(), StoreError>;

    /// Matches involving `identity`, newest first.
    async fn list_matches(&self, identity: &Identity) -> Result<Vec<MatchRecord>, StoreError>;
}
