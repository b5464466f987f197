//! Application shell for Meteo: configuration, errors, logging and the
//! [`App`] lifecycle around the weather pipeline.

pub mod app;
pub mod config;
pub mod error;

pub use app::App;
pub use config::{
    ApiConfig, CacheConfig, Config, LocationConfig, RepositoryConfig, SyncConfig, ValidationResult,
};
pub use error::{AppError, ConfigError};

use anyhow::Result;

/// Initialize logging. `RUST_LOG` overrides the default `info` filter.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;

    tracing::debug!("Meteo core initialized");
    Ok(())
}
