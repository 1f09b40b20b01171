use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

use crate::retry::{Classify, ErrorKind};
use crate::run_state::Cancelled;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source not found: {url}")]
    SourceMissing { url: String },

    #[error("source responded with HTTP {status}")]
    SourceStatus { status: StatusCode },

    #[error("source request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("destination for '{relative_path}' escapes the output directory or has none")]
    UnsafeDestination { relative_path: String },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, TransferError>;

impl TransferError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }
}

impl Classify for TransferError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Network(_) | TransferError::Io { .. } => ErrorKind::Transient,
            TransferError::SourceStatus { status }
                if status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS =>
            {
                ErrorKind::Transient
            }
            TransferError::DigestMismatch { .. } | TransferError::SizeMismatch { .. } => {
                ErrorKind::Integrity
            }
            TransferError::SourceMissing { .. }
            | TransferError::SourceStatus { .. }
            | TransferError::UnsafeDestination { .. } => ErrorKind::Terminal,
            TransferError::Cancelled(_) => ErrorKind::Shutdown,
            TransferError::Unexpected(_) => ErrorKind::Fatal,
        }
    }
}
