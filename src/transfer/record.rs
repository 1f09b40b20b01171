use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::backend::TransferItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Downloaded,
    /// A valid local copy already existed
    Reused,
    Failed,
}

impl Outcome {
    /// Short label for the history table
    pub fn action(self) -> &'static str {
        match self {
            Outcome::Downloaded => "DL",
            Outcome::Reused => "REUSED",
            Outcome::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Outcome::Downloaded => "downloaded",
            Outcome::Reused => "reused",
            Outcome::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One finished item, as sent to the history reporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub job_id: String,
    pub task_id: String,
    pub size: u64,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub worker: String,
    pub path: Option<PathBuf>,
}

impl ResultRecord {
    pub fn new(
        item: &TransferItem,
        outcome: Outcome,
        started_at: DateTime<Utc>,
        worker: &str,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            id: item.id.clone(),
            job_id: item.job_id.clone(),
            task_id: item.task_id.clone(),
            size: item.size,
            outcome,
            started_at,
            completed_at: Utc::now(),
            worker: worker.to_string(),
            path,
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        (self.completed_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}
