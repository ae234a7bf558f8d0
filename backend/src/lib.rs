//! Session tokens for the tracker backend: short-lived access tokens and
//! rotating refresh tokens with reuse detection.
//!
//! The HTTP layer calls [`SessionManager`] for login, refresh and logout.
//! Refresh tokens live behind [`RefreshTokenStore`]; SQLite and in-memory
//! implementations are provided.

pub mod config;
pub mod db;
pub mod middleware;
pub mod models;
pub mod services;

pub use config::{Config, SessionConfig};
pub use models::{IssuedRefreshToken, RefreshToken};
pub use services::memory_store::InMemoryRefreshTokenStore;
pub use services::refresh_tokens::{RefreshTokenStore, SqliteRefreshTokenStore, StoreError};
pub use services::session::{SessionError, SessionManager, TokenPair};
pub use services::token_codec::{CodecError, Identity, TokenCodec};
pub use services::users::{CredentialVerifier, SqliteCredentialVerifier, VerifiedUser};
