use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backend REST endpoint and credentials
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_accept_version")]
    pub accept_version: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Attempts for each backend call on 5xx or network errors
    #[serde(default = "default_backend_tries")]
    pub tries: u32,
    /// Static bearer token; skips the API key exchange when set
    pub token: Option<String>,
    /// Long-lived API key (loaded from environment, not from config file)
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            accept_version: default_accept_version(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            tries: default_backend_tries(),
            token: None,
            api_key: None,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://api.conductortech.com".to_string()
}

fn default_accept_version() -> String {
    "v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_backend_tries() -> u32 {
    3
}

/// Per-worker transfer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
    /// Attempts per item, first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_backoff_ms")]
    pub max_poll_backoff_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_error_pause_ms")]
    pub error_pause_ms: u64,
    /// Overrides the output directory the backend assigns to each item
    pub output_dir: Option<PathBuf>,
    /// Unix permission bits applied to completed files; omitted leaves
    /// them as created
    pub file_mode: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_backoff_ms: default_max_poll_backoff_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            error_pause_ms: default_error_pause_ms(),
            output_dir: None,
            file_mode: None,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.max_poll_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn error_pause(&self) -> Duration {
        Duration::from_millis(self.error_pause_ms)
    }
}

fn default_thread_count() -> usize {
    5
}

fn default_chunk_size() -> ByteSize {
    ByteSize::mib(1)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_poll_backoff_ms() -> u64 {
    15_000
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_error_pause_ms() -> u64 {
    5_000
}

/// Scope of the items `next` may hand out
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FilterConfig {
    pub account: Option<String>,
    pub project: Option<String>,
    pub location: Option<String>,
}

/// Rolling history table
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
    #[serde(default = "default_history_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
            interval_secs: default_history_interval_secs(),
        }
    }
}

impl HistoryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_history_capacity() -> usize {
    100
}

fn default_history_interval_secs() -> u64 {
    10
}

/// Backoff schedule shared by item and backend retries
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    32_000
}
