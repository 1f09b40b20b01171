use reqwest::StatusCode;
use thiserror::Error;

use crate::retry::{Classify, ErrorKind};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("backend responded with HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("still unauthorized after token refresh (HTTP {0})")]
    Unauthorized(StatusCode),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

impl Classify for BackendError {
    fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Network(_) => ErrorKind::Transient,
            BackendError::Status { status, .. } if status.is_server_error() => {
                ErrorKind::Transient
            }
            BackendError::Status { .. }
            | BackendError::Unauthorized(_)
            | BackendError::TokenExchange(_)
            | BackendError::Decode(_)
            | BackendError::InvalidUrl(_) => ErrorKind::Terminal,
        }
    }
}
