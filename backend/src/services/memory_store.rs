use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::{IssuedRefreshToken, RefreshToken};
use crate::services::refresh_tokens::{
    generate_token_value, hash_token_value, root_record, successor_record, RefreshTokenStore,
    StoreError,
};

/// In-process refresh token store for tests and single-node tools.
///
/// Each operation runs inside one critical section, which gives
/// `revoke_and_link` the same all-or-nothing behavior as the conditional
/// UPDATE in the SQLite store.
#[derive(Debug, Default)]
pub struct InMemoryRefreshTokenStore {
    tokens: Mutex<HashMap<Uuid, RefreshToken>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RefreshToken>> {
        // A panic while holding the lock cannot leave a half-written record
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, issued: IssuedRefreshToken) -> Result<IssuedRefreshToken, StoreError> {
        let mut tokens = self.lock();
        if tokens.values().any(|t| t.token_hash == issued.token.token_hash) {
            return Err(StoreError::CorruptRecord(
                "duplicate refresh token value".to_string(),
            ));
        }
        tokens.insert(issued.token.id, issued.token.clone());
        Ok(issued)
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn create(&self, user_id: &Uuid, ttl: Duration) -> Result<IssuedRefreshToken, StoreError> {
        self.insert(root_record(user_id, generate_token_value(), ttl))
    }

    async fn create_successor(
        &self,
        parent: &RefreshToken,
        token_value: &str,
        ttl: Duration,
    ) -> Result<IssuedRefreshToken, StoreError> {
        self.insert(successor_record(parent, token_value.to_string(), ttl))
    }

    async fn find_by_value(&self, token_value: &str) -> Result<RefreshToken, StoreError> {
        let token_hash = hash_token_value(token_value);
        self.lock()
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn revoke_and_link(
        &self,
        token_id: &Uuid,
        replaced_by_token_value: &str,
    ) -> Result<(), StoreError> {
        let mut tokens = self.lock();
        let token = tokens.get_mut(token_id).ok_or(StoreError::NotFound)?;

        if token.revoked_at.is_some() {
            return Err(StoreError::AlreadyRevoked);
        }

        token.revoked_at = Some(Utc::now());
        token.replaced_by_token_hash = Some(hash_token_value(replaced_by_token_value));
        Ok(())
    }

    async fn revoke(&self, token_id: &Uuid) -> Result<bool, StoreError> {
        let mut tokens = self.lock();
        match tokens.get_mut(token_id) {
            Some(token) if token.revoked_at.is_none() => {
                token.revoked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_for_user(&self, user_id: &Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut count = 0;

        for token in self.lock().values_mut() {
            if token.user_id == *user_id && token.is_active_at(now) {
                token.revoked_at = Some(now);
                count += 1;
            }
        }

        Ok(count)
    }

    async fn revoke_chain_from(&self, token_id: &Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut tokens = self.lock();

        let by_hash: HashMap<String, Uuid> = tokens
            .values()
            .map(|t| (t.token_hash.clone(), t.id))
            .collect();

        let mut chain = HashSet::new();
        let mut next = tokens.contains_key(token_id).then_some(*token_id);

        while let Some(id) = next {
            if !chain.insert(id) {
                break;
            }
            next = tokens
                .get(&id)
                .and_then(|t| t.replaced_by_token_hash.as_ref())
                .and_then(|hash| by_hash.get(hash).copied());
        }

        // From a root, unlinked successors of the same chain go too
        if tokens.get(token_id).is_some_and(|t| t.is_root()) {
            chain.extend(
                tokens
                    .values()
                    .filter(|t| t.chain_id == *token_id)
                    .map(|t| t.id),
            );
        }

        let mut count = 0;
        for id in &chain {
            let Some(token) = tokens.get_mut(id) else {
                continue;
            };
            if token.revoked_at.is_none() || token.compromised_at.is_none() {
                token.revoked_at.get_or_insert(now);
                token.compromised_at.get_or_insert(now);
                count += 1;
            }
        }

        Ok(count)
    }

    async fn list_active_for_user(&self, user_id: &Uuid) -> Result<Vec<RefreshToken>, StoreError> {
        let now = Utc::now();
        let mut active: Vec<RefreshToken> = self
            .lock()
            .values()
            .filter(|t| t.user_id == *user_id && t.is_active_at(now))
            .cloned()
            .collect();

        active.sort_by_key(|t| t.issued_at);
        Ok(active)
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tokens = self.lock();

        let mut newest_expiry: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for token in tokens.values() {
            let entry = newest_expiry.entry(token.chain_id).or_insert(token.expires_at);
            if token.expires_at > *entry {
                *entry = token.expires_at;
            }
        }

        let before = tokens.len();
        tokens.retain(|_, t| newest_expiry.get(&t.chain_id).is_some_and(|exp| *exp >= cutoff));

        Ok((before - tokens.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::refresh_tokens::conformance;

    #[tokio::test]
    async fn test_create_and_find() {
        conformance::create_and_find(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_find_unknown_value() {
        conformance::find_unknown_value(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_revoke_and_link_is_compare_and_set() {
        conformance::revoke_and_link_is_compare_and_set(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_revoke_and_link_unknown_id() {
        conformance::revoke_and_link_unknown_id(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_revoke_does_not_link() {
        conformance::revoke_does_not_link(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_revoke_all_for_user_only_touches_active() {
        conformance::revoke_all_for_user_only_touches_active(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_revoke_chain_from_root_marks_whole_chain() {
        conformance::revoke_chain_from_root_marks_whole_chain(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_revoke_chain_from_root_includes_unlinked_successors() {
        conformance::revoke_chain_from_root_includes_unlinked_successors(&InMemoryRefreshTokenStore::new())
            .await;
    }

    #[tokio::test]
    async fn test_list_active_for_user() {
        conformance::list_active_for_user(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_purge_expired_removes_whole_chains() {
        conformance::purge_expired_removes_whole_chains(&InMemoryRefreshTokenStore::new()).await;
    }

    #[tokio::test]
    async fn test_revoke_chain_from_unknown_id() {
        let store = InMemoryRefreshTokenStore::new();
        assert_eq!(store.revoke_chain_from(&Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_value_rejected() {
        let store = InMemoryRefreshTokenStore::new();
        let parent = store.create(&Uuid::new_v4(), Duration::days(1)).await.unwrap();

        let duplicate = store
            .create_successor(&parent.token, &parent.token_value, Duration::days(1))
            .await;

        assert!(duplicate.is_err());
    }
}
