//! Moving one item from its source URL to the local disk
//!
//! A [`TransferWorker`] owns one concurrency slot. It polls an
//! [`ItemSource`], streams the file through a [`SourceFetcher`] into a
//! `.part` file while hashing it, and reports the outcome to the backend.
//! Its [`HeartbeatReporter`] touches the item while bytes keep moving.

pub mod digest;
pub mod error;
pub mod fetch;
pub mod heartbeat;
pub mod progress;
pub mod record;
pub mod source;
pub mod status;
pub mod worker;

pub use error::{Result, TransferError};
pub use fetch::{ByteStream, FetchConfig, HttpFetcher, SourceFetcher};
pub use heartbeat::HeartbeatReporter;
pub use progress::{Progress, ProgressSnapshot};
pub use record::{Outcome, ResultRecord};
pub use source::{BackendSource, ItemSource, JobSource, Polled};
pub use status::{ActiveTransfer, CurrentItem, WorkerMonitor};
pub use worker::{TransferWorker, WorkerSettings, WorkerShared, WorkerState};
