pub mod auth;

pub use auth::{extract_identity, AuthMiddlewareError};
