//! Observability (metrics, tracing)

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Name of the log file written under `--log-dir`
pub const LOG_FILE_NAME: &str = "renderferry.log";

/// Where and how loudly to log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    /// `-v` count: 0 = info, 1 = debug, 2+ = trace
    pub verbosity: u8,
    /// Explicit level; wins over `verbosity`
    pub level: Option<String>,
    /// Also append plain-text logs to `<dir>/renderferry.log`
    pub dir: Option<PathBuf>,
}

impl LogSettings {
    /// Filter directive used when `RUST_LOG` is unset
    pub fn directive(&self) -> &str {
        if let Some(level) = &self.level {
            return level;
        }
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Install the global subscriber: console, plus a log file when `dir` is set
///
/// `RUST_LOG` wins when set. Returns the log file path.
pub fn init_tracing(settings: &LogSettings) -> std::io::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.directive()));

    let (file_layer, log_path) = match &settings.dir {
        Some(dir) => {
            let (path, file) = open_log_file(dir)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    // A subscriber may already be installed (tests)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .try_init();

    Ok(log_path)
}

/// Create `dir` if needed and open its log file for appending
pub fn open_log_file(dir: &Path) -> std::io::Result<(PathBuf, File)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

/// Process-wide transfer counters
#[derive(Debug, Default)]
pub struct Metrics {
    items_downloaded: AtomicU64,
    items_reused: AtomicU64,
    items_failed: AtomicU64,
    items_abandoned: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_downloaded(&self, bytes: u64) {
        self.items_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        tracing::trace!(counter = "items_downloaded", "Metric incremented");
    }

    pub fn item_reused(&self) {
        self.items_reused.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "items_reused", "Metric incremented");
    }

    pub fn item_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "items_failed", "Metric incremented");
    }

    pub fn item_abandoned(&self) {
        self.items_abandoned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "items_abandoned", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_downloaded: self.items_downloaded.load(Ordering::Relaxed),
            items_reused: self.items_reused.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            items_abandoned: self.items_abandoned.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub items_downloaded: u64,
    pub items_reused: u64,
    pub items_failed: u64,
    pub items_abandoned: u64,
    pub bytes_downloaded: u64,
}

impl MetricsSnapshot {
    pub fn items_total(&self) -> u64 {
        self.items_downloaded + self.items_reused + self.items_failed + self.items_abandoned
    }
}
