use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Session Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Token pair handed out by login and refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// One active refresh token, without its secret value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub chain_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// API Response Types
// ============================================================================

/// Error codes exposed at the API boundary.
///
/// Refresh failures all collapse into `SessionExpired` so callers cannot tell
/// a replayed token from an unknown or revoked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorCode {
    InvalidCredentials,
    SessionExpired,
    Unauthorized,
    InternalError,
}

impl ApiErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidCredentials => "invalid_credentials",
            ApiErrorCode::SessionExpired => "session_expired",
            ApiErrorCode::Unauthorized => "unauthorized",
            ApiErrorCode::InternalError => "internal_error",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidCredentials => "Invalid email or password",
            ApiErrorCode::SessionExpired => "Session expired, please log in again",
            ApiErrorCode::Unauthorized => "Invalid or missing token",
            ApiErrorCode::InternalError => "Internal server error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown error code: {0}")]
pub struct UnknownErrorCode(pub String);

impl FromStr for ApiErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "invalid_credentials" => Ok(ApiErrorCode::InvalidCredentials),
            "session_expired" => Ok(ApiErrorCode::SessionExpired),
            "unauthorized" => Ok(ApiErrorCode::Unauthorized),
            "internal_error" => Ok(ApiErrorCode::InternalError),
            _ => Err(UnknownErrorCode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn from_code(code: ApiErrorCode) -> Self {
        Self {
            error: code.as_str().to_string(),
            message: code.default_message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSuccess<T> {
    pub data: T,
}

impl<T> ApiSuccess<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_success() {
        let success = ApiSuccess::new("test data");
        assert_eq!(success.data, "test data");
    }

    #[test]
    fn test_api_error_code_from_str() {
        assert_eq!("session_expired".parse(), Ok(ApiErrorCode::SessionExpired));
        assert_eq!("INVALID_CREDENTIALS".parse(), Ok(ApiErrorCode::InvalidCredentials));
        assert_eq!("Unauthorized".parse(), Ok(ApiErrorCode::Unauthorized));
        assert_eq!("internal_error".parse(), Ok(ApiErrorCode::InternalError));
        assert_eq!(
            "token_reuse_detected".parse::<ApiErrorCode>(),
            Err(UnknownErrorCode("token_reuse_detected".to_string()))
        );
    }

    #[test]
    fn test_api_error_from_code() {
        let error = ApiError::from_code(ApiErrorCode::SessionExpired);
        assert_eq!(error.error, "session_expired");
        assert_eq!(error.message, "Session expired, please log in again");
    }

    #[test]
    fn test_api_error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ApiErrorCode::InvalidCredentials).unwrap();
        assert_eq!(json, "\"invalid_credentials\"");
    }

    #[test]
    fn test_token_pair_response_json_fields() {
        let now = Utc::now();
        let response = TokenPairResponse {
            access_token: "a.b.c".to_string(),
            refresh_token: "opaque".to_string(),
            token_type: "Bearer".to_string(),
            access_expires_at: now,
            refresh_expires_at: now,
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["access_token"], "a.b.c");
        assert_eq!(value["refresh_token"], "opaque");
        assert_eq!(value["token_type"], "Bearer");
        assert!(value.get("access_expires_at").is_some());
    }
}
