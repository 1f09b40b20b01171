use super::models::Config;
use thiserror::Error;

/// Upper bound for a single read/write chunk
const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("thread_count must be at least 1")]
    NoWorkers,

    #[error("chunk_size must be between 1 byte and {limit} bytes, got {actual}")]
    InvalidChunkSize { actual: u64, limit: u64 },

    #[error("max_attempts must be at least 1")]
    NoAttempts,

    #[error("backend tries must be at least 1")]
    NoBackendTries,

    #[error("history capacity must be at least 1")]
    EmptyHistory,

    #[error("heartbeat interval must be positive")]
    InvalidHeartbeatInterval,

    #[error("history interval must be positive")]
    InvalidHistoryInterval,

    #[error("poll interval must be positive")]
    InvalidPollInterval,

    #[error("Invalid backend URL scheme in '{url}', expected 'http://' or 'https://'")]
    InvalidBaseUrl { url: String },

    #[error("No credentials: set RENDERFERRY_API_KEY or backend.token")]
    MissingCredentials,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_worker(config)?;
    validate_backend(config)?;
    validate_history(config)?;
    Ok(())
}

fn validate_worker(config: &Config) -> Result<(), ValidationError> {
    let worker = &config.worker;

    if worker.thread_count == 0 {
        return Err(ValidationError::NoWorkers);
    }

    let chunk = worker.chunk_size.as_u64();
    if chunk == 0 || chunk > MAX_CHUNK_BYTES {
        return Err(ValidationError::InvalidChunkSize {
            actual: chunk,
            limit: MAX_CHUNK_BYTES,
        });
    }

    if worker.max_attempts == 0 {
        return Err(ValidationError::NoAttempts);
    }

    if worker.heartbeat_interval_secs == 0 {
        return Err(ValidationError::InvalidHeartbeatInterval);
    }

    if worker.poll_interval_ms == 0 {
        return Err(ValidationError::InvalidPollInterval);
    }

    Ok(())
}

fn validate_backend(config: &Config) -> Result<(), ValidationError> {
    let backend = &config.backend;

    if !(backend.base_url.starts_with("http://") || backend.base_url.starts_with("https://")) {
        return Err(ValidationError::InvalidBaseUrl {
            url: backend.base_url.clone(),
        });
    }

    if backend.tries == 0 {
        return Err(ValidationError::NoBackendTries);
    }

    if backend.api_key.is_none() && backend.token.is_none() {
        return Err(ValidationError::MissingCredentials);
    }

    Ok(())
}

fn validate_history(config: &Config) -> Result<(), ValidationError> {
    if config.history.capacity == 0 {
        return Err(ValidationError::EmptyHistory);
    }
    if config.history.interval_secs == 0 {
        return Err(ValidationError::InvalidHistoryInterval);
    }
    Ok(())
}
