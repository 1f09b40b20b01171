//! Configuration management for renderferry
//!
//! Settings are layered, lowest priority first:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables
//! 4. Command line flags (applied by the daemon runner)
//!
//! # Environment Variables
//!
//! Any value can be overridden with `RENDERFERRY__<section>__<key>`:
//! - `RENDERFERRY__WORKER__THREAD_COUNT=8`
//! - `RENDERFERRY__BACKEND__BASE_URL=http://localhost:8081`
//! - `RENDERFERRY__WORKER__CHUNK_SIZE=2MB`
//!
//! The API key is a secret and is only read from `RENDERFERRY_API_KEY`.
//!
//! # Configuration File
//!
//! By default the file is `config/renderferry.toml`; `RENDERFERRY_CONFIG`
//! or `--config` point elsewhere.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{BackendConfig, Config, FilterConfig, HistoryConfig, RetryConfig, WorkerConfig};
pub use validation::ValidationError;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from file and environment, without validating
    ///
    /// The daemon applies CLI overrides before calling [`Config::validate`].
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Ok(sources::load(path)?)
    }

    /// Load and validate configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate(self)
    }
}
