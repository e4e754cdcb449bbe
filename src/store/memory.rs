//! In-process account store.
//!
//! Backs [`UserStore`] with maps behind tokio `RwLock`s. Used by the binary
//! when no external store is wired in, and by tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StoreError, UserRecord, UserStore};
use crate::core::{Identity, MatchRecord};

/// Memory-backed user store.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<BTreeMap<Identity, UserRecord>>,
    matches: RwLock<Vec<MatchRecord>>,
    unavailable: AtomicBool,
}

impl MemoryUserStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`]
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored match records.
    pub async fn match_count(&self) -> usize {
        self.matches.read().await.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create_user(&self, user: UserRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let mut users = self.users.write().await;
        if users.contains_key(&user.identity) {
            return Err(StoreError::AlreadyExists(user.identity));
        }
        users.insert(user.identity.clone(), user);
        Ok(())
    }

    async fn get_user(&self, identity: &Identity) -> Result<UserRecord, StoreError> {
        self.check_available()?;
        self.users
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(identity.clone()))
    }

    async fn adjust_rating(&self, identity: &Identity, delta: i32) -> Result<(), StoreError> {
        self.check_available()?;
        let mut users = self.users.write().await;
        let user = users
            .get_mut(identity)
            .ok_or_else(|| StoreError::NotFound(identity.clone()))?;
        user.rating += delta;
        Ok(())
    }

    async fn append_match_record(&self, record: MatchRecord) -> Result<(), StoreError> {
        self.check_available()?;
        self.matches.write().await.push(record);
        Ok(())
    }

    async fn list_matches(&self, identity: &Identity) -> Result<Vec<MatchRecord>, StoreError> {
        self.check_available()?;
        let matches = self.matches.read().await;
        Ok(matches
            .iter()
            .rev()
            .filter(|m| m.involves(identity))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MatchOutcome;

    async fn store_with(names: &[&str]) -> MemoryUserStore {
        let store = MemoryUserStore::new();
        for name in names {
            store
                .create_user(UserRecord::new(Identity::new(*name), 600))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store_with(&["alice"]).await;
        let user = store.get_user(&Identity::new("alice")).await.unwrap();
        assert_eq!(user.rating, 600);
        assert_eq!(store.get_rating(&Identity::new("alice")).await.unwrap(), 600);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let store = store_with(&["alice"]).await;
        let result = store
            .create_user(UserRecord::new(Identity::new("alice"), 600))
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_missing_user() {
        let store = MemoryUserStore::new();
        let result = store.get_rating(&Identity::new("ghost")).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));

        let result = store.adjust_rating(&Identity::new("ghost"), 8).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_adjust_rating() {
        let store = store_with(&["alice"]).await;
        store.adjust_rating(&Identity::new("alice"), 8).await.unwrap();
        store.adjust_rating(&Identity::new("alice"), -3).await.unwrap();
        assert_eq!(store.get_rating(&Identity::new("alice")).await.unwrap(), 605);
    }

    #[tokio::test]
    async fn test_list_matches_newest_first() {
        let store = store_with(&["alice", "bob", "carol"]).await;
        let alice = Identity::new("alice");
        let bob = Identity::new("bob");
        let carol = Identity::new("carol");

        store
            .append_match_record(MatchRecord::new(alice.clone(), bob.clone(), MatchOutcome::AWin))
            .await
            .unwrap();
        store
            .append_match_record(MatchRecord::new(bob.clone(), carol.clone(), MatchOutcome::Draw))
            .await
            .unwrap();
        store
            .append_match_record(MatchRecord::new(carol.clone(), alice.clone(), MatchOutcome::BWin))
            .await
            .unwrap();

        let alice_matches = store.list_matches(&alice).await.unwrap();
        assert_eq!(alice_matches.len(), 2);
        assert_eq!(alice_matches[0].player_a, carol);
        assert_eq!(alice_matches[1].player_b, bob);

        assert_eq!(store.match_count().await, 3);
    }

    #[tokio::test]
    async fn test_unavailable_switch() {
        let store = store_with(&["alice"]).await;
        store.set_unavailable(true);
        assert!(matches!(
            store.get_rating(&Identity::new("alice")).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(false);
        assert!(store.get_rating(&Identity::new("alice")).await.is_ok());
    }
}
