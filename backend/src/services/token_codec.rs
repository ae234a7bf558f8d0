use chrono::{DateTime, Duration, SubsecRound, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Minimum length in bytes of the HMAC signing secret
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Signing secret must be at least {} bytes", MIN_SECRET_LEN)]
    WeakSecret,
    #[error("Invalid token signature")]
    InvalidSignature,
    #[error("Token has expired")]
    Expired,
    #[error("Malformed token")]
    Malformed,
    #[error("JWT error: {0}")]
    Encoding(jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub sid: String,
    pub exp: i64,
    pub iat: i64,
}

/// Who an access token was issued to, and under which login session.
/// `session_id` is the chain id of the refresh token lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies short-lived HS256 access tokens.
///
/// Access tokens are never stored; everything needed to check one is in the
/// token itself plus the shared secret.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: &str) -> Result<Self, CodecError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CodecError::WeakSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<AccessToken, CodecError> {
        // JWT timestamps have whole-second resolution
        let now = Utc::now().trunc_subsecs(0);
        let expires_at = now + ttl;

        let claims = Claims {
            sub: identity.user_id.to_string(),
            sid: identity.session_id.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(CodecError::Encoding)?;

        Ok(AccessToken { token, expires_at })
    }

    pub fn verify(&self, token: &str) -> Result<Identity, CodecError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CodecError::Expired,
                ErrorKind::InvalidSignature => CodecError::InvalidSignature,
                _ => CodecError::Malformed,
            })?;

        let user_id = Uuid::parse_str(&token_data.claims.sub).map_err(|_| CodecError::Malformed)?;
        let session_id = Uuid::parse_str(&token_data.claims.sid).map_err(|_| CodecError::Malformed)?;

        Ok(Identity { user_id, session_id })
    }
}
