pub mod background_jobs;
pub mod memory_store;
pub mod refresh_tokens;
pub mod session;
pub mod token_codec;
pub mod users;
