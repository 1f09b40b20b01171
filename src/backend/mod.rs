//! File-io backend: the queue that hands out transfer items
//!
//! [`Backend`] is the stateless RPC seam; [`HttpBackend`] talks REST to the
//! real service, [`BackendSession`] adds retries bound to a worker's
//! run-state.

pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod session;

pub use auth::{BearerToken, HttpTokenSource, StaticTokenSource, TokenCache, TokenSource};
pub use client::HttpBackend;
pub use error::{BackendError, Result};
pub use models::{Filters, JobItems, TransferItem};
pub use session::BackendSession;

use async_trait::async_trait;

/// Backend verdict on a status call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Accepted,
    /// HTTP 410: the item is no longer active (finished, failed or reassigned)
    Inactive,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Lease the next pending item, `None` when the queue is empty
    async fn next(&self, filters: &Filters) -> Result<Option<TransferItem>>;

    /// Liveness report for an in-flight item
    async fn touch(&self, id: &str, bytes_transferred: u64, filters: &Filters) -> Result<Ack>;

    async fn finish(&self, id: &str, bytes_downloaded: u64, filters: &Filters) -> Result<Ack>;

    async fn fail(&self, id: &str, bytes_downloaded: u64, filters: &Filters) -> Result<Ack>;

    /// Every item of a job, optionally narrowed to one task
    async fn job_items(&self, job_id: &str, task_id: Option<&str>) -> Result<Vec<TransferItem>>;
}
