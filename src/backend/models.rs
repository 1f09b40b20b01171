//! Wire types exchanged with the file-io backend

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::config::FilterConfig;

/// One file to move, as handed out by the backend queue
///
/// Immutable once fetched; a worker consumes it exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: String,
    pub job_id: String,
    #[serde(default)]
    pub task_id: String,
    /// Pre-signed source URL
    pub url: String,
    /// Destination relative to the output directory
    pub relative_path: String,
    /// Output directory assigned by the backend (usually the job's)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    pub size: u64,
    /// Base64-encoded MD5 of the file content
    pub md5: String,
}

impl TransferItem {
    /// Local destination: `<override or output_dir>/<relative_path>`
    ///
    /// `None` when no output directory is known, or the relative path would
    /// escape it or does not name a file below it.
    pub fn destination(&self, output_override: Option<&Path>) -> Option<PathBuf> {
        let base = output_override.or(self.output_dir.as_deref())?;
        let relative = Path::new(&self.relative_path);

        let confined = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        let has_name = relative
            .components()
            .any(|component| matches!(component, Component::Normal(_)));
        let names_directory =
            self.relative_path.ends_with('/') || self.relative_path.ends_with("/.");
        if !confined || !has_name || names_directory {
            return None;
        }

        Some(base.join(relative))
    }
}

/// `downloader/jobs/{job_id}` response
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobItems {
    #[serde(default)]
    pub items: Vec<TransferItem>,
}

/// Account/project/location scope for `next` and the status calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl From<&FilterConfig> for Filters {
    fn from(config: &FilterConfig) -> Self {
        Self {
            account: config.account.clone(),
            project: config.project.clone(),
            location: config.location.clone(),
        }
    }
}

/// `PUT downloader/touch/{id}` body
#[derive(Debug, Clone, Serialize)]
pub struct TouchRequest<'a> {
    pub bytes_transferred: u64,
    #[serde(flatten)]
    pub scope: &'a Filters,
}

/// `PUT downloader/finish/{id}` and `downloader/fail/{id}` body
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest<'a> {
    pub bytes_downloaded: u64,
    #[serde(flatten)]
    pub scope: &'a Filters,
}

/// `GET api/oauth_jwt` response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}
