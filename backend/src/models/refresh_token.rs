use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Database model for refresh tokens
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RefreshTokenRow {
    pub id: String,
    pub user_id: String,
    pub chain_id: String,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by_token_hash: Option<String>,
    pub compromised_at: Option<DateTime<Utc>>,
}

impl RefreshTokenRow {
    pub fn to_token(&self) -> Result<RefreshToken, uuid::Error> {
        Ok(RefreshToken {
            id: Uuid::parse_str(&self.id)?,
            user_id: Uuid::parse_str(&self.user_id)?,
            chain_id: Uuid::parse_str(&self.chain_id)?,
            token_hash: self.token_hash.clone(),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
            replaced_by_token_hash: self.replaced_by_token_hash.clone(),
            compromised_at: self.compromised_at,
        })
    }
}

/// A refresh token record.
///
/// `chain_id` is the id of the token issued at login; every successor
/// produced by rotation carries the same value. Only the SHA-256 digest of
/// the bearer value is kept: `token_hash` for this token and
/// `replaced_by_token_hash` for the successor it was rotated into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub chain_id: Uuid,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by_token_hash: Option<String>,
    pub compromised_at: Option<DateTime<Utc>>,
}

/// A token that was just persisted, together with its bearer value.
/// The value is handed to the client once and cannot be recovered later.
#[derive(Clone)]
pub struct IssuedRefreshToken {
    pub token_value: String,
    pub token: RefreshToken,
}

impl std::fmt::Debug for IssuedRefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedRefreshToken")
            .field("token_value", &"<redacted>")
            .field("token", &self.token)
            .finish()
    }
}

/// State of a refresh token as observed by a refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTokenState {
    Active,
    Expired,
    RevokedByRotation,
    RevokedOther,
}

impl RefreshTokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTokenState::Active => "active",
            RefreshTokenState::Expired => "expired",
            RefreshTokenState::RevokedByRotation => "revoked_by_rotation",
            RefreshTokenState::RevokedOther => "revoked_other",
        }
    }
}

impl RefreshToken {
    pub fn is_root(&self) -> bool {
        self.id == self.chain_id
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && !self.is_expired_at(now)
    }

    /// Expiry is checked before revocation: an expired token never triggers
    /// any follow-up action.
    pub fn state_at(&self, now: DateTime<Utc>) -> RefreshTokenState {
        if self.is_expired_at(now) {
            return RefreshTokenState::Expired;
        }

        match (self.revoked_at, &self.replaced_by_token_hash) {
            (None, _) => RefreshTokenState::Active,
            (Some(_), Some(_)) => RefreshTokenState::RevokedByRotation,
            (Some(_), None) => RefreshTokenState::RevokedOther,
        }
    }

    pub fn to_session_info(&self) -> shared::SessionInfo {
        shared::SessionInfo {
            id: self.id,
            chain_id: self.chain_id,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }
}
