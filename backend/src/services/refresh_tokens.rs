use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{IssuedRefreshToken, RefreshToken, RefreshTokenRow};

/// Entropy of a refresh token value, in bytes
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Refresh token not found")]
    NotFound,
    #[error("Refresh token already revoked")]
    AlreadyRevoked,
    #[error("Corrupt refresh token record: {0}")]
    CorruptRecord(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable storage for refresh tokens.
///
/// Callers pass bearer values; implementations persist only their
/// [`hash_token_value`] digest. `revoke_and_link` is the only coordination
/// point between concurrent refreshes: implementations must perform it as a
/// single conditional write, never as a read followed by a write.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Persist a new root token with a fresh value.
    async fn create(&self, user_id: &Uuid, ttl: Duration) -> Result<IssuedRefreshToken, StoreError>;

    /// Persist the successor of `parent` using a value generated by the caller.
    async fn create_successor(
        &self,
        parent: &RefreshToken,
        token_value: &str,
        ttl: Duration,
    ) -> Result<IssuedRefreshToken, StoreError>;

    async fn find_by_value(&self, token_value: &str) -> Result<RefreshToken, StoreError>;

    /// Set `revoked_at` and link the successor value only if the token is
    /// not revoked yet. Fails with `AlreadyRevoked` otherwise.
    async fn revoke_and_link(
        &self,
        token_id: &Uuid,
        replaced_by_token_value: &str,
    ) -> Result<(), StoreError>;

    /// Revoke a single token without a successor. Returns false if it was
    /// already revoked.
    async fn revoke(&self, token_id: &Uuid) -> Result<bool, StoreError>;

    /// Revoke every active token of the user. Returns the number revoked.
    async fn revoke_all_for_user(&self, user_id: &Uuid) -> Result<u64, StoreError>;

    /// Walk successor links forward from `token_id`, revoking every token
    /// and flagging all of them compromised. Starting from a root also
    /// catches successors of the chain that were never linked (left behind
    /// by a lost rotation race). Returns the number of tokens that changed.
    async fn revoke_chain_from(&self, token_id: &Uuid) -> Result<u64, StoreError>;

    async fn list_active_for_user(&self, user_id: &Uuid) -> Result<Vec<RefreshToken>, StoreError>;

    /// Delete every chain whose newest token expired before `cutoff`.
    /// Chains are removed whole so reuse detection never sees a broken chain.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Generate an opaque refresh token value (256 bits from the OS RNG).
pub fn generate_token_value() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Digest under which a token value is stored and looked up
pub fn hash_token_value(token_value: &str) -> String {
    hex::encode(Sha256::digest(token_value.as_bytes()))
}

/// Short, non-reversible identifier of a token value for log lines
pub fn fingerprint(token_value: &str) -> String {
    hex::encode(&Sha256::digest(token_value.as_bytes())[..6])
}

pub(crate) fn root_record(user_id: &Uuid, token_value: String, ttl: Duration) -> IssuedRefreshToken {
    let id = Uuid::new_v4();
    let now = Utc::now();

    IssuedRefreshToken {
        token: RefreshToken {
            id,
            user_id: *user_id,
            chain_id: id,
            token_hash: hash_token_value(&token_value),
            issued_at: now,
            expires_at: now + ttl,
            revoked_at: None,
            replaced_by_token_hash: None,
            compromised_at: None,
        },
        token_value,
    }
}

pub(crate) fn successor_record(
    parent: &RefreshToken,
    token_value: String,
    ttl: Duration,
) -> IssuedRefreshToken {
    let now = Utc::now();

    IssuedRefreshToken {
        token: RefreshToken {
            id: Uuid::new_v4(),
            user_id: parent.user_id,
            chain_id: parent.chain_id,
            token_hash: hash_token_value(&token_value),
            issued_at: now,
            expires_at: now + ttl,
            revoked_at: None,
            replaced_by_token_hash: None,
            compromised_at: None,
        },
        token_value,
    }
}

/// SQLite-backed refresh token store
#[derive(Debug, Clone)]
pub struct SqliteRefreshTokenStore {
    pool: SqlitePool,
}

impl SqliteRefreshTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(&self, token: &RefreshToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
                (id, user_id, chain_id, token_hash, issued_at, expires_at, revoked_at, replaced_by_token_hash, compromised_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL)
            "#,
        )
        .bind(token.id.to_string())
        .bind(token.user_id.to_string())
        .bind(token.chain_id.to_string())
        .bind(&token.token_hash)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn to_token(row: &RefreshTokenRow) -> Result<RefreshToken, StoreError> {
    row.to_token()
        .map_err(|e| StoreError::CorruptRecord(format!("refresh token {}: {}", row.id, e)))
}

#[async_trait]
impl RefreshTokenStore for SqliteRefreshTokenStore {
    async fn create(&self, user_id: &Uuid, ttl: Duration) -> Result<IssuedRefreshToken, StoreError> {
        let issued = root_record(user_id, generate_token_value(), ttl);
        self.insert(&issued.token).await?;
        Ok(issued)
    }

    async fn create_successor(
        &self,
        parent: &RefreshToken,
        token_value: &str,
        ttl: Duration,
    ) -> Result<IssuedRefreshToken, StoreError> {
        let issued = successor_record(parent, token_value.to_string(), ttl);
        self.insert(&issued.token).await?;
        Ok(issued)
    }

    async fn find_by_value(&self, token_value: &str) -> Result<RefreshToken, StoreError> {
        let row: RefreshTokenRow = sqlx::query_as("SELECT * FROM refresh_tokens WHERE token_hash = ?")
            .bind(hash_token_value(token_value))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        to_token(&row)
    }

    async fn revoke_and_link(
        &self,
        token_id: &Uuid,
        replaced_by_token_value: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = ?, replaced_by_token_hash = ?
            WHERE id = ? AND revoked_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(hash_token_value(replaced_by_token_value))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Lost the compare-and-set; report why
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM refresh_tokens WHERE id = ?")
            .bind(token_id.to_string())
            .fetch_one(&self.pool)
            .await?;

        if exists == 0 {
            Err(StoreError::NotFound)
        } else {
            Err(StoreError::AlreadyRevoked)
        }
    }

    async fn revoke(&self, token_id: &Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revoke_all_for_user(&self, user_id: &Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = ?
            WHERE user_id = ? AND revoked_at IS NULL AND expires_at > ?
            "#,
        )
        .bind(now)
        .bind(user_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_chain_from(&self, token_id: &Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            WITH RECURSIVE chain(id, replaced_by_token_hash) AS (
                SELECT id, replaced_by_token_hash FROM refresh_tokens WHERE id = ?
                UNION
                SELECT t.id, t.replaced_by_token_hash
                FROM refresh_tokens t
                JOIN chain c ON t.token_hash = c.replaced_by_token_hash
            )
            UPDATE refresh_tokens
            SET revoked_at = COALESCE(revoked_at, ?),
                compromised_at = COALESCE(compromised_at, ?)
            WHERE (id IN (SELECT id FROM chain)
                   OR chain_id = (SELECT id FROM refresh_tokens WHERE id = ? AND chain_id = id))
              AND (revoked_at IS NULL OR compromised_at IS NULL)
            "#,
        )
        .bind(token_id.to_string())
        .bind(now)
        .bind(now)
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_active_for_user(&self, user_id: &Uuid) -> Result<Vec<RefreshToken>, StoreError> {
        let rows: Vec<RefreshTokenRow> = sqlx::query_as(
            r#"
            SELECT * FROM refresh_tokens
            WHERE user_id = ? AND revoked_at IS NULL AND expires_at > ?
            ORDER BY issued_at
            "#,
        )
        .bind(user_id.to_string())
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(to_token).collect()
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM refresh_tokens
            WHERE chain_id IN (
                SELECT chain_id FROM refresh_tokens
                GROUP BY chain_id
                HAVING MAX(expires_at) < ?
            )
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        // A single connection keeps the in-memory database alive and shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        pool
    }

    async fn store() -> SqliteRefreshTokenStore {
        SqliteRefreshTokenStore::new(setup_test_db().await)
    }

    #[test]
    fn test_generate_token_value_is_unique_and_url_safe() {
        let a = generate_token_value();
        let b = generate_token_value();

        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_hash_token_value() {
        assert_eq!(
            hash_token_value("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(hash_token_value("abc"), hash_token_value("abd"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 12);
        assert_eq!(fingerprint("abc"), "ba7816bf8f01");
    }

    #[tokio::test]
    async fn test_create_and_find() {
        conformance::create_and_find(&store().await).await;
    }

    #[tokio::test]
    async fn test_find_unknown_value() {
        conformance::find_unknown_value(&store().await).await;
    }

    #[tokio::test]
    async fn test_revoke_and_link_is_compare_and_set() {
        conformance::revoke_and_link_is_compare_and_set(&store().await).await;
    }

    #[tokio::test]
    async fn test_revoke_and_link_unknown_id() {
        conformance::revoke_and_link_unknown_id(&store().await).await;
    }

    #[tokio::test]
    async fn test_revoke_does_not_link() {
        conformance::revoke_does_not_link(&store().await).await;
    }

    #[tokio::test]
    async fn test_revoke_all_for_user_only_touches_active() {
        conformance::revoke_all_for_user_only_touches_active(&store().await).await;
    }

    #[tokio::test]
    async fn test_revoke_chain_from_root_marks_whole_chain() {
        conformance::revoke_chain_from_root_marks_whole_chain(&store().await).await;
    }

    #[tokio::test]
    async fn test_revoke_chain_from_root_includes_unlinked_successors() {
        conformance::revoke_chain_from_root_includes_unlinked_successors(&store().await).await;
    }

    #[tokio::test]
    async fn test_list_active_for_user() {
        conformance::list_active_for_user(&store().await).await;
    }

    #[tokio::test]
    async fn test_purge_expired_removes_whole_chains() {
        conformance::purge_expired_removes_whole_chains(&store().await).await;
    }

    #[tokio::test]
    async fn test_token_hash_is_unique_in_schema() {
        let store = store().await;
        let parent = store.create(&Uuid::new_v4(), Duration::days(1)).await.unwrap();

        let duplicate = store
            .create_successor(&parent.token, &parent.token_value, Duration::days(1))
            .await;

        assert!(matches!(duplicate, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn test_plaintext_value_is_not_persisted() {
        let pool = setup_test_db().await;
        let store = SqliteRefreshTokenStore::new(pool.clone());
        let parent = store.create(&Uuid::new_v4(), Duration::days(1)).await.unwrap();
        let child = store
            .create_successor(&parent.token, &generate_token_value(), Duration::days(1))
            .await
            .unwrap();
        store.revoke_and_link(&parent.token.id, &child.token_value).await.unwrap();

        let stored: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT token_hash, replaced_by_token_hash FROM refresh_tokens")
                .fetch_all(&pool)
                .await
                .unwrap();

        assert_eq!(stored.len(), 2);
        for (hash, replaced_by) in stored {
            for value in [&parent.token_value, &child.token_value] {
                assert_ne!(&hash, value);
                assert_ne!(replaced_by.as_ref(), Some(value));
            }
        }
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let pool = setup_test_db().await;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, chain_id, token_hash, issued_at, expires_at)
            VALUES ('broken', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(hash_token_value("corrupt-value"))
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        let store = SqliteRefreshTokenStore::new(pool);
        assert!(matches!(
            store.find_by_value("corrupt-value").await,
            Err(StoreError::CorruptRecord(_))
        ));
    }
}
