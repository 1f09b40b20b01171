use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "RENDERFERRY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/renderferry.toml";
const ENV_PREFIX: &str = "RENDERFERRY";
const ENV_SEPARATOR: &str = "__";
const API_KEY_ENV_VAR: &str = "RENDERFERRY_API_KEY";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load(explicit_path: Option<PathBuf>) -> Result<Config, ConfigError> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let config_path = explicit_path
        .or_else(|| env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config);

    Ok(config)
}

/// The API key only ever comes from the environment
fn load_secrets(config: &mut Config) {
    if let Ok(api_key) = env::var(API_KEY_ENV_VAR) {
        if !api_key.trim().is_empty() {
            config.backend.api_key = Some(api_key);
        }
    }
}

/// Load configuration from a specific path and environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::debug!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // RENDERFERRY__WORKER__THREAD_COUNT -> worker.thread_count
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
