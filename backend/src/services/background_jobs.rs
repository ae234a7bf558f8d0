use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::time;

use crate::config::Config;
use crate::services::refresh_tokens::{RefreshTokenStore, StoreError};

#[derive(Debug, Error)]
pub enum BackgroundJobError {
    #[error("Token store error: {0}")]
    StoreError(#[from] StoreError),
}

/// Report from one retention sweep
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub processed_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub tokens_purged: u64,
}

/// Configuration for the refresh token retention sweeper
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Time between sweeps
    pub interval: std::time::Duration,
    /// How long a chain is kept after its newest token expired
    pub retention: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(3600),
            retention: Duration::days(30),
        }
    }
}

impl JobConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retention: config.token_retention(),
            ..Self::default()
        }
    }
}

/// Start the retention sweeper.
/// Runs forever; spawn it on the runtime and abort the handle to stop it.
pub async fn start_token_sweeper<S: RefreshTokenStore>(store: Arc<S>, config: JobConfig) {
    log::info!(
        "Refresh token sweeper started: every {}s, retention {} days",
        config.interval.as_secs(),
        config.retention.num_days()
    );

    loop {
        time::sleep(config.interval).await;

        match purge_expired_tokens(store.as_ref(), config.retention).await {
            Ok(report) => {
                if report.tokens_purged > 0 {
                    log::info!(
                        "Purged {} refresh tokens from chains expired before {}",
                        report.tokens_purged,
                        report.cutoff
                    );
                } else {
                    log::debug!("No refresh tokens to purge");
                }
            }
            Err(e) => {
                log::error!("Error purging refresh tokens: {}", e);
            }
        }
    }
}

/// Delete every chain whose newest token expired more than `retention` ago
pub async fn purge_expired_tokens<S: RefreshTokenStore + ?Sized>(
    store: &S,
    retention: Duration,
) -> Result<SweepReport, BackgroundJobError> {
    let now = Utc::now();
    let cutoff = now - retention;
    let tokens_purged = store.purge_expired(cutoff).await?;

    Ok(SweepReport {
        processed_at: now,
        cutoff,
        tokens_purged,
    })
}
