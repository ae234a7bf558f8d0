use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::Utc;
use rand_core::OsRng;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::UserRow;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("User already exists")]
    UserAlreadyExists,
    #[error("Password hashing error")]
    HashingError,
    #[error("Corrupt user record: {0}")]
    CorruptRecord(String),
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Result of a successful credential check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub user_id: Uuid,
    pub email: String,
    pub is_active: bool,
}

/// User lookup consumed by login.
///
/// Returns `Ok(None)` when the user does not exist or the password does not
/// match; callers must not be able to tell the two apart.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<VerifiedUser>, LookupError>;
}

pub fn hash_password(password: &str) -> Result<String, LookupError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| LookupError::HashingError)
}

/// Verifies credentials against the `users` table (argon2 PHC hashes)
#[derive(Debug, Clone)]
pub struct SqliteCredentialVerifier {
    pool: SqlitePool,
}

impl SqliteCredentialVerifier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialVerifier for SqliteCredentialVerifier {
    async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<VerifiedUser>, LookupError> {
        let user: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        let Some(user) = user else {
            return Ok(None);
        };

        let parsed_hash = match PasswordHash::new(&user.password_hash) {
            Ok(hash) => hash,
            Err(e) => {
                log::error!("Unparseable password hash for user {}: {}", user.id, e);
                return Ok(None);
            }
        };

        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_err()
        {
            return Ok(None);
        }

        let user_id = user
            .user_id()
            .map_err(|e| LookupError::CorruptRecord(format!("user {}: {}", user.id, e)))?;

        Ok(Some(VerifiedUser {
            user_id,
            email: user.email,
            is_active: user.is_active,
        }))
    }
}

/// Insert a user with a hashed password. Account management lives outside
/// this crate; this exists for seeding and tests.
pub async fn create_user(pool: &SqlitePool, email: &str, password: &str) -> Result<Uuid, LookupError> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?")
        .bind(email)
        .fetch_one(pool)
        .await?;

    if existing > 0 {
        return Err(LookupError::UserAlreadyExists);
    }

    let id = Uuid::new_v4();
    let password_hash = hash_password(password)?;

    sqlx::query(
        r#"
        INSERT INTO users (id, email, password_hash, is_active, created_at)
        VALUES (?, ?, ?, 1, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(email)
    .bind(&password_hash)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(id)
}

pub async fn set_user_active(pool: &SqlitePool, user_id: &Uuid, is_active: bool) -> Result<(), LookupError> {
    sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
        .bind(is_active)
        .bind(user_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
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

    #[test]
    fn test_password_hashing() {
        let hash = hash_password("test_password123").unwrap();
        let parsed_hash = PasswordHash::new(&hash).unwrap();

        assert!(Argon2::default()
            .verify_password(b"test_password123", &parsed_hash)
            .is_ok());
        assert!(Argon2::default()
            .verify_password(b"wrong_password", &parsed_hash)
            .is_err());
    }

    #[tokio::test]
    async fn test_verify_credentials_success() {
        let pool = setup_test_db().await;
        let user_id = create_user(&pool, "alice@example.com", "correct horse").await.unwrap();
        let verifier = SqliteCredentialVerifier::new(pool);

        let user = verifier
            .verify_credentials("alice@example.com", "correct horse")
            .await
            .unwrap()
            .expect("credentials should match");

        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email, "alice@example.com");
        assert!(user.is_active);
    }

    #[tokio::test]
    async fn test_verify_credentials_wrong_password() {
        let pool = setup_test_db().await;
        create_user(&pool, "alice@example.com", "correct horse").await.unwrap();
        let verifier = SqliteCredentialVerifier::new(pool);

        let user = verifier
            .verify_credentials("alice@example.com", "battery staple")
            .await
            .unwrap();

        assert!(user.is_none());
    }

    #[tokio::test]
    async fn test_verify_credentials_unknown_email() {
        let pool = setup_test_db().await;
        let verifier = SqliteCredentialVerifier::new(pool);

        let user = verifier
            .verify_credentials("nobody@example.com", "whatever")
            .await
            .unwrap();

        assert!(user.is_none());
    }

    #[tokio::test]
    async fn test_verify_credentials_reports_inactive() {
        let pool = setup_test_db().await;
        let user_id = create_user(&pool, "bob@example.com", "hunter22").await.unwrap();
        set_user_active(&pool, &user_id, false).await.unwrap();
        let verifier = SqliteCredentialVerifier::new(pool);

        let user = verifier
            .verify_credentials("bob@example.com", "hunter22")
            .await
            .unwrap()
            .unwrap();

        assert!(!user.is_active);
    }

    #[tokio::test]
    async fn test_create_user_duplicate_email() {
        let pool = setup_test_db().await;
        create_user(&pool, "alice@example.com", "pw-one").await.unwrap();

        let result = create_user(&pool, "alice@example.com", "pw-two").await;
        assert!(matches!(result, Err(LookupError::UserAlreadyExists)));
    }
}
