use crate::services::token_codec::{CodecError, Identity, TokenCodec};

/// Extract the caller's identity from an `Authorization` header value
pub fn extract_identity(
    authorization: Option<&str>,
    codec: &TokenCodec,
) -> Result<Identity, AuthMiddlewareError> {
    let auth_str = authorization.ok_or(AuthMiddlewareError::MissingToken)?;

    let token = auth_str
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthMiddlewareError::InvalidToken)?;

    codec.verify(token).map_err(|e| match e {
        CodecError::Expired => AuthMiddlewareError::ExpiredToken,
        _ => AuthMiddlewareError::InvalidToken,
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthMiddlewareError {
    MissingToken,
    InvalidToken,
    ExpiredToken,
}

impl std::fmt::Display for AuthMiddlewareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMiddlewareError::MissingToken => write!(f, "Missing authorization token"),
            AuthMiddlewareError::InvalidToken => write!(f, "Invalid authorization token"),
            AuthMiddlewareError::ExpiredToken => write!(f, "Expired authorization token"),
        }
    }
}

impl std::error::Error for AuthMiddlewareError {}
