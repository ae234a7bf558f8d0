//! Login, refresh-token rotation with reuse detection, and logout.
//!
//! A refresh token observed by `refresh` is in one of four states (see
//! [`RefreshTokenState`]):
//!
//! ```text
//! Active ──rotate──> RevokedByRotation ──presented again──> whole chain revoked
//!   │                                                       (TokenReuseDetected)
//!   ├──logout / chain revocation──> RevokedOther ──> RevokedToken
//!   └──time passes──> Expired ──> ExpiredToken
//! ```
//!
//! The manager holds no locks. Two refreshes racing on the same token are
//! settled by the store's conditional `revoke_and_link`: exactly one wins and
//! the loser is handled as token reuse.

use chrono::Utc;
use shared::{ApiError, ApiErrorCode, SessionInfo, TokenPairResponse};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::models::{IssuedRefreshToken, RefreshToken, RefreshTokenState};
use crate::services::refresh_tokens::{fingerprint, generate_token_value, RefreshTokenStore, StoreError};
use crate::services::token_codec::{AccessToken, CodecError, Identity, TokenCodec};
use crate::services::users::{CredentialVerifier, LookupError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account is inactive")]
    InactiveAccount,
    #[error("Invalid refresh token")]
    InvalidToken,
    #[error("Refresh token has expired")]
    ExpiredToken,
    #[error("Refresh token has been revoked")]
    RevokedToken,
    #[error("Refresh token reuse detected")]
    TokenReuseDetected,
    #[error("Invalid access token")]
    InvalidAccessToken,
    #[error("Access token has expired")]
    ExpiredAccessToken,
    #[error("Token store error: {0}")]
    Store(#[from] StoreError),
    #[error("Token codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("User lookup error: {0}")]
    Lookup(#[from] LookupError),
}

impl SessionError {
    /// True for expected business outcomes, false for infrastructure failures
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            SessionError::Store(_) | SessionError::Codec(_) | SessionError::Lookup(_)
        )
    }

    /// Code shown to API callers. Every refresh failure maps to the same
    /// code; the distinguishing cause is only logged.
    pub fn api_code(&self) -> ApiErrorCode {
        match self {
            SessionError::InvalidCredentials | SessionError::InactiveAccount => {
                ApiErrorCode::InvalidCredentials
            }
            SessionError::InvalidToken
            | SessionError::ExpiredToken
            | SessionError::RevokedToken
            | SessionError::TokenReuseDetected => ApiErrorCode::SessionExpired,
            SessionError::InvalidAccessToken | SessionError::ExpiredAccessToken => {
                ApiErrorCode::Unauthorized
            }
            SessionError::Store(_) | SessionError::Codec(_) | SessionError::Lookup(_) => {
                ApiErrorCode::InternalError
            }
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError::from_code(self.api_code())
    }
}

/// Access and refresh token handed out by login and refresh
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: chrono::DateTime<Utc>,
    pub refresh_expires_at: chrono::DateTime<Utc>,
}

impl TokenPair {
    fn new(access: AccessToken, refresh: IssuedRefreshToken) -> Self {
        Self {
            access_token: access.token,
            refresh_token: refresh.token_value,
            access_expires_at: access.expires_at,
            refresh_expires_at: refresh.token.expires_at,
        }
    }

    pub fn to_response(&self) -> TokenPairResponse {
        TokenPairResponse {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            token_type: "Bearer".to_string(),
            access_expires_at: self.access_expires_at,
            refresh_expires_at: self.refresh_expires_at,
        }
    }
}

/// Why a rotated token showed up again
#[derive(Debug, Clone, Copy)]
enum ReuseCause {
    Replay,
    ConcurrentRotation,
}

impl ReuseCause {
    fn as_str(&self) -> &'static str {
        match self {
            ReuseCause::Replay => "replay of a rotated token",
            ReuseCause::ConcurrentRotation => "lost concurrent rotation",
        }
    }
}

pub struct SessionManager<S, U> {
    store: Arc<S>,
    users: U,
    codec: TokenCodec,
    config: SessionConfig,
}

impl<S, U> SessionManager<S, U>
where
    S: RefreshTokenStore,
    U: CredentialVerifier,
{
    pub fn new(store: Arc<S>, users: U, codec: TokenCodec, config: SessionConfig) -> Self {
        Self {
            store,
            users,
            codec,
            config,
        }
    }

    /// Shared handle to the token store, e.g. for the retention sweeper
    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Verify credentials and start a new session chain. Existing sessions
    /// of the user are left alone.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, SessionError> {
        let user = match self.users.verify_credentials(email, password).await? {
            Some(user) => user,
            None => {
                log::warn!("Login rejected: invalid credentials");
                return Err(SessionError::InvalidCredentials);
            }
        };

        if !user.is_active {
            log::warn!("Login rejected: user {} is inactive", user.user_id);
            return Err(SessionError::InactiveAccount);
        }

        let refresh = self
            .store
            .create(&user.user_id, self.config.refresh_token_ttl)
            .await?;
        let access = self.issue_access_token(&refresh.token)?;

        log::info!(
            "User {} logged in, session {} started",
            user.user_id,
            refresh.token.chain_id
        );

        Ok(TokenPair::new(access, refresh))
    }

    /// Exchange a refresh token for a new pair. The presented token can
    /// succeed at most once.
    pub async fn refresh(&self, presented: &str) -> Result<TokenPair, SessionError> {
        let token = match self.store.find_by_value(presented).await {
            Ok(token) => token,
            Err(StoreError::NotFound) => {
                log::warn!("Refresh rejected: unknown token {}", fingerprint(presented));
                return Err(SessionError::InvalidToken);
            }
            Err(e) => return Err(e.into()),
        };

        let state = token.state_at(Utc::now());
        match state {
            RefreshTokenState::Active => self.rotate(token, presented).await,
            RefreshTokenState::Expired => {
                log::info!(
                    "Refresh rejected: token {} of user {} is {} since {}",
                    fingerprint(presented),
                    token.user_id,
                    state.as_str(),
                    token.expires_at
                );
                Err(SessionError::ExpiredToken)
            }
            RefreshTokenState::RevokedOther => {
                log::warn!(
                    "Refresh rejected: token {} of user {} is {}",
                    fingerprint(presented),
                    token.user_id,
                    state.as_str()
                );
                Err(SessionError::RevokedToken)
            }
            RefreshTokenState::RevokedByRotation => Err(self
                .revoke_compromised_chain(&token, presented, ReuseCause::Replay)
                .await),
        }
    }

    /// Revoke every active refresh token of the user. Calling it again is
    /// not an error; it simply revokes nothing.
    pub async fn logout(&self, user_id: &Uuid) -> Result<u64, SessionError> {
        let revoked = self.store.revoke_all_for_user(user_id).await?;
        log::info!("User {} logged out, {} sessions revoked", user_id, revoked);
        Ok(revoked)
    }

    pub async fn active_sessions(&self, user_id: &Uuid) -> Result<Vec<SessionInfo>, SessionError> {
        let tokens = self.store.list_active_for_user(user_id).await?;
        Ok(tokens.iter().map(RefreshToken::to_session_info).collect())
    }

    /// Verify an access token presented with a request
    pub fn authenticate(&self, access_token: &str) -> Result<Identity, SessionError> {
        self.codec.verify(access_token).map_err(|e| match e {
            CodecError::Expired => SessionError::ExpiredAccessToken,
            CodecError::InvalidSignature | CodecError::Malformed => SessionError::InvalidAccessToken,
            other => SessionError::Codec(other),
        })
    }

    fn issue_access_token(&self, refresh: &RefreshToken) -> Result<AccessToken, SessionError> {
        let identity = Identity {
            user_id: refresh.user_id,
            session_id: refresh.chain_id,
        };
        Ok(self.codec.issue(&identity, self.config.access_token_ttl)?)
    }

    async fn rotate(&self, parent: RefreshToken, presented: &str) -> Result<TokenPair, SessionError> {
        // The child exists before the parent points at it, so a revoked
        // parent always has a successor to walk to.
        let child = self
            .store
            .create_successor(&parent, &generate_token_value(), self.config.refresh_token_ttl)
            .await?;

        match self.store.revoke_and_link(&parent.id, &child.token_value).await {
            Ok(()) => {}
            Err(StoreError::AlreadyRevoked) => {
                self.retire_orphan(&child.token).await;
                return Err(self.resolve_lost_rotation(presented).await);
            }
            Err(e) => {
                self.retire_orphan(&child.token).await;
                return Err(e.into());
            }
        }

        let access = self.issue_access_token(&child.token)?;

        log::info!(
            "Rotated refresh token for user {} in session {}",
            child.token.user_id,
            child.token.chain_id
        );

        Ok(TokenPair::new(access, child))
    }

    /// Revoke a successor that was never linked and never handed out.
    /// Failure only leaves behind a token nobody holds, so it is logged and
    /// the refresh carries on.
    async fn retire_orphan(&self, child: &RefreshToken) {
        if let Err(e) = self.store.revoke(&child.id).await {
            log::error!("Failed to retire orphaned token {}: {}", child.id, e);
        }
    }

    /// Another request changed the parent between our read and our
    /// compare-and-set. Re-read it to learn what happened; never retry.
    async fn resolve_lost_rotation(&self, presented: &str) -> SessionError {
        let current = match self.store.find_by_value(presented).await {
            Ok(current) => current,
            Err(e) => return e.into(),
        };

        let state = current.state_at(Utc::now());
        match state {
            RefreshTokenState::Expired | RefreshTokenState::RevokedOther => {
                log::warn!(
                    "Refresh rejected: token {} of user {} became {} during rotation",
                    fingerprint(presented),
                    current.user_id,
                    state.as_str()
                );
                if state == RefreshTokenState::Expired {
                    SessionError::ExpiredToken
                } else {
                    SessionError::RevokedToken
                }
            }
            // Active cannot follow a failed compare-and-set; treat it as
            // reuse rather than hand out a second successor.
            RefreshTokenState::RevokedByRotation | RefreshTokenState::Active => {
                self.revoke_compromised_chain(&current, presented, ReuseCause::ConcurrentRotation)
                    .await
            }
        }
    }

    async fn revoke_compromised_chain(
        &self,
        token: &RefreshToken,
        presented: &str,
        cause: ReuseCause,
    ) -> SessionError {
        log::error!(
            "Refresh token reuse detected ({}): token {} of user {}, session {}",
            cause.as_str(),
            fingerprint(presented),
            token.user_id,
            token.chain_id
        );

        match self.store.revoke_chain_from(&token.chain_id).await {
            Ok(count) => {
                log::warn!(
                    "Session {} of user {} revoked, {} tokens flagged compromised",
                    token.chain_id,
                    token.user_id,
                    count
                );
                SessionError::TokenReuseDetected
            }
            Err(e) => {
                log::error!("Failed to revoke session {}: {}", token.chain_id, e);
                e.into()
            }
        }
    }
}
