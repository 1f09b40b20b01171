//! Transfer worker: poll, resolve, stream, verify, report

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use super::digest::{ContentDigest, hash_file};
use super::error::{Result, TransferError};
use super::fetch::SourceFetcher;
use super::heartbeat::HeartbeatReporter;
use super::progress::Progress;
use super::record::{Outcome, ResultRecord};
use super::source::{ItemSource, Polled};
use super::status::{CurrentItem, WorkerMonitor};
use crate::backend::session::SessionResult;
use crate::backend::{Ack, Backend, BackendSession, Filters, TransferItem};
use crate::config::WorkerConfig;
use crate::observability::Metrics;
use crate::retry::{Backoff, Classify, ErrorKind, RetryError, RetryPolicy};
use crate::run_state::{Cancelled, RunState, RunStateWatcher};

const PART_SUFFIX: &str = "part";

/// Where a worker is in its loop, published for observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Resolving,
    Transferring,
    Verifying,
    Reporting,
    Aborting,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-worker knobs taken from `[worker]`
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub chunk_size: usize,
    pub output_dir: Option<PathBuf>,
    pub file_mode: Option<u32>,
    pub poll_interval: Duration,
    pub max_poll_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub error_pause: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.as_usize().max(1),
            output_dir: config.output_dir.clone(),
            file_mode: config.file_mode,
            poll_interval: config.poll_interval(),
            max_poll_backoff: config.max_poll_backoff(),
            heartbeat_interval: config.heartbeat_interval(),
            error_pause: config.error_pause(),
        }
    }
}

/// Handles every worker clones from the orchestrator
#[derive(Clone)]
pub struct WorkerShared {
    pub backend: Arc<dyn Backend>,
    /// Applied to each backend call
    pub backend_policy: RetryPolicy,
    /// Applied to resolve/transfer/verify of one item
    pub item_policy: RetryPolicy,
    pub filters: Arc<Filters>,
    pub source: Arc<dyn ItemSource>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub results: broadcast::Sender<ResultRecord>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transferred {
    Reused,
    Downloaded { bytes: u64 },
}

pub struct TransferWorker {
    name: String,
    settings: WorkerSettings,
    session: BackendSession,
    item_policy: RetryPolicy,
    poll_backoff: Backoff,
    source: Arc<dyn ItemSource>,
    fetcher: Arc<dyn SourceFetcher>,
    results: broadcast::Sender<ResultRecord>,
    metrics: Arc<Metrics>,
    run_state: RunStateWatcher,
    progress: Progress,
    current_item: watch::Sender<Option<CurrentItem>>,
    state: watch::Sender<WorkerState>,
}

impl TransferWorker {
    pub fn new(
        name: impl Into<String>,
        settings: WorkerSettings,
        shared: WorkerShared,
        run_state: RunStateWatcher,
    ) -> Self {
        let session = BackendSession::new(
            shared.backend,
            shared.backend_policy,
            run_state.clone(),
            shared.filters,
        );
        let poll_backoff = Backoff::Exponential {
            base: settings.poll_interval,
            max: settings.max_poll_backoff.max(settings.poll_interval),
            jitter: true,
        };

        Self {
            name: name.into(),
            settings,
            session,
            item_policy: shared.item_policy,
            poll_backoff,
            source: shared.source,
            fetcher: shared.fetcher,
            results: shared.results,
            metrics: shared.metrics,
            run_state,
            progress: Progress::new(),
            current_item: watch::channel(None).0,
            state: watch::channel(WorkerState::Idle).0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Read-only view for status rendering
    pub fn monitor(&self) -> WorkerMonitor {
        WorkerMonitor::new(
            self.name.clone(),
            self.state(),
            self.current_item.subscribe(),
            self.progress.clone(),
        )
    }

    /// Poll and process items until the run-state leaves `Running` or the
    /// source is exhausted
    pub async fn run(self) {
        let span = info_span!("worker", worker = %self.name);
        async move {
            info!("Worker started");

            let heartbeat = HeartbeatReporter::new(
                self.session.clone(),
                self.progress.clone(),
                self.current_item.subscribe(),
                self.run_state.clone(),
                self.settings.heartbeat_interval,
            );
            let heartbeat = tokio::spawn(heartbeat.run().in_current_span());

            self.poll_loop().await;

            heartbeat.abort();
            let _ = heartbeat.await;
            self.set_state(WorkerState::Stopped);
            info!(run_state = %self.run_state.current(), "Worker stopped");
        }
        .instrument(span)
        .await
    }

    async fn poll_loop(&self) {
        let mut idle_polls = 0u32;

        while self.run_state.is_running() {
            self.set_state(WorkerState::Polling);

            match self.source.poll(&self.session).await {
                Ok(Polled::Item(item)) => {
                    idle_polls = 0;
                    self.handle_item(item).await;
                }
                Ok(Polled::Empty) => {
                    idle_polls = idle_polls.saturating_add(1);
                    self.set_state(WorkerState::Idle);
                    let delay = self
                        .poll_backoff
                        .delay(idle_polls)
                        .max(self.settings.poll_interval);
                    trace!(delay_ms = delay.as_millis() as u64, "Nothing pending");
                    if self.run_state.sleep(delay).await.is_err() {
                        break;
                    }
                }
                Ok(Polled::Exhausted) => {
                    info!("No more items to transfer");
                    break;
                }
                Err(RetryError::Cancelled(_)) => break,
                Err(error) => {
                    warn!(error = %error, "Polling for work failed");
                    self.set_state(WorkerState::Idle);
                    if self.run_state.sleep(self.settings.error_pause).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Contains every failure of one item, panics included
    async fn handle_item(&self, item: TransferItem) {
        let span = info_span!(
            "item",
            item_id = %item.id,
            job_id = %item.job_id,
            task_id = %item.task_id
        );

        let outcome = AssertUnwindSafe(self.process(&item))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        if let Err(panic) = outcome {
            let error = TransferError::Unexpected(panic_message(panic.as_ref()));
            span.in_scope(|| self.abandon(&error));
            self.end_item();
            let _ = self.run_state.sleep(self.settings.error_pause).await;
            return;
        }

        self.end_item();
    }

    async fn process(&self, item: &TransferItem) {
        let started_at = Utc::now();
        self.progress.reset();
        self.current_item.send_replace(Some(CurrentItem {
            item: Arc::new(item.clone()),
            baseline: self.progress.snapshot().updates,
        }));
        self.set_state(WorkerState::Resolving);
        info!(size = item.size, relative_path = %item.relative_path, "Processing item");

        let Some(destination) = item.destination(self.settings.output_dir.as_deref()) else {
            let error = TransferError::UnsafeDestination {
                relative_path: item.relative_path.clone(),
            };
            self.report_failure(item, started_at, None, &error).await;
            return;
        };

        let result = self
            .item_policy
            .run(
                &self.run_state,
                |error: &TransferError| error.is_retryable(),
                |attempt| self.attempt(item, &destination, attempt),
            )
            .await;

        match result {
            Ok(transferred) => {
                self.report_success(item, started_at, destination, transferred)
                    .await
            }
            Err(error) => {
                if let Some(state) = cancelled_state(&error) {
                    self.set_state(WorkerState::Aborting);
                    info!(%state, path = %destination.display(), "Transfer interrupted, item left to the backend");
                    return;
                }
                match error.into_inner() {
                    Some(error) if error.kind() == ErrorKind::Fatal => self.abandon(&error),
                    Some(error) => {
                        self.report_failure(item, started_at, Some(destination), &error)
                            .await
                    }
                    None => {}
                }
            }
        }
    }

    /// One resolve/transfer/verify pass; the retry policy calls it again on
    /// transient and integrity failures
    async fn attempt(
        &self,
        item: &TransferItem,
        destination: &Path,
        attempt: u32,
    ) -> Result<Transferred> {
        if attempt > 1 {
            info!(attempt, "Retrying item");
        }
        self.set_state(WorkerState::Resolving);
        self.progress.reset();

        if self.is_reusable(item, destination).await? {
            return Ok(Transferred::Reused);
        }

        self.progress.reset();
        let part = part_path(destination);
        match self.download(item, destination, &part).await {
            Ok(bytes) => Ok(Transferred::Downloaded { bytes }),
            Err(error) => {
                if self.run_state.current() != RunState::Killed {
                    remove_if_exists(&part).await;
                }
                Err(error)
            }
        }
    }

    /// `true` when the destination already holds the expected content;
    /// a stale copy is deleted
    async fn is_reusable(&self, item: &TransferItem, destination: &Path) -> Result<bool> {
        let metadata = match tokio::fs::metadata(destination).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(TransferError::io(destination, e)),
        };

        if metadata.is_file() && metadata.len() == item.size {
            let local = hash_file(
                destination,
                self.settings.chunk_size,
                &self.progress,
                &self.run_state,
            )
            .await?;
            if local == item.md5 {
                info!(path = %destination.display(), "Local copy is current, skipping transfer");
                return Ok(true);
            }
        }

        info!(path = %destination.display(), "Removing stale local copy");
        tokio::fs::remove_file(destination)
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        Ok(false)
    }

    /// Stream the source into `<destination>.part`, verify, then move it into place
    async fn download(
        &self,
        item: &TransferItem,
        destination: &Path,
        part: &Path,
    ) -> Result<u64> {
        self.set_state(WorkerState::Transferring);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
        // Leftover from an interrupted run
        remove_if_exists(part).await;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(part)
            .await
            .map_err(|e| TransferError::io(part, e))?;

        let mut stream = self.fetcher.open(&item.url).await?;
        let chunk_size = self.settings.chunk_size;
        let mut pending = BytesMut::with_capacity(chunk_size);
        let mut digest = ContentDigest::new();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                state = self.run_state.stopped() => return Err(Cancelled(state).into()),
                next = stream.next() => next,
            };
            let Some(data) = next else { break };

            pending.extend_from_slice(&data?);
            while pending.len() >= chunk_size {
                let chunk = pending.split_to(chunk_size);
                written += self.write_chunk(&mut file, part, &chunk, &mut digest).await?;
            }
        }
        if !pending.is_empty() {
            let chunk = pending.split();
            written += self.write_chunk(&mut file, part, &chunk, &mut digest).await?;
        }

        file.flush().await.map_err(|e| TransferError::io(part, e))?;
        file.sync_all().await.map_err(|e| TransferError::io(part, e))?;
        drop(file);

        self.set_state(WorkerState::Verifying);
        if written != item.size {
            return Err(TransferError::SizeMismatch {
                expected: item.size,
                actual: written,
            });
        }
        let actual = digest.finish();
        if actual != item.md5 {
            return Err(TransferError::DigestMismatch {
                expected: item.md5.clone(),
                actual,
            });
        }

        tokio::fs::rename(part, destination)
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        self.apply_file_mode(destination).await;

        Ok(written)
    }

    async fn write_chunk(
        &self,
        file: &mut tokio::fs::File,
        part: &Path,
        chunk: &[u8],
        digest: &mut ContentDigest,
    ) -> Result<u64> {
        self.run_state.ensure_running()?;
        file.write_all(chunk)
            .await
            .map_err(|e| TransferError::io(part, e))?;
        digest.update(chunk);
        self.progress.add(chunk.len() as u64);
        Ok(chunk.len() as u64)
    }

    #[cfg(unix)]
    async fn apply_file_mode(&self, path: &Path) {
        use std::os::unix::fs::PermissionsExt;

        let Some(mode) = self.settings.file_mode else {
            return;
        };
        let permissions = std::fs::Permissions::from_mode(mode);
        if let Err(e) = tokio::fs::set_permissions(path, permissions).await {
            warn!(path = %path.display(), error = %e, "Could not set file permissions");
        }
    }

    #[cfg(not(unix))]
    async fn apply_file_mode(&self, _path: &Path) {}

    async fn report_success(
        &self,
        item: &TransferItem,
        started_at: DateTime<Utc>,
        destination: PathBuf,
        transferred: Transferred,
    ) {
        self.set_state(WorkerState::Reporting);

        let (outcome, bytes) = match transferred {
            Transferred::Reused => {
                self.metrics.item_reused();
                (Outcome::Reused, 0)
            }
            Transferred::Downloaded { bytes } => {
                self.metrics.item_downloaded(bytes);
                (Outcome::Downloaded, bytes)
            }
        };
        info!(
            path = %destination.display(),
            bytes,
            action = outcome.action(),
            "Item complete"
        );

        if self.run_state.current() != RunState::Killed {
            let reply = self.session.finish(&item.id, bytes).await;
            log_report("finish", reply);
        }
        self.publish(ResultRecord::new(
            item,
            outcome,
            started_at,
            &self.name,
            Some(destination),
        ));
    }

    async fn report_failure(
        &self,
        item: &TransferItem,
        started_at: DateTime<Utc>,
        destination: Option<PathBuf>,
        error: &TransferError,
    ) {
        self.set_state(WorkerState::Reporting);
        self.metrics.item_failed();

        let bytes = self.progress.bytes();
        error!(error = %error, kind = ?error.kind(), bytes, "Item failed");

        if self.run_state.current() != RunState::Killed {
            let reply = self.session.fail(&item.id, bytes).await;
            log_report("fail", reply);
        }
        self.publish(ResultRecord::new(
            item,
            Outcome::Failed,
            started_at,
            &self.name,
            destination,
        ));
    }

    /// Fatal-to-worker: log and drop the item without telling the backend
    fn abandon(&self, error: &TransferError) {
        self.metrics.item_abandoned();
        error!(error = %error, "Unexpected failure, item abandoned");
    }

    fn publish(&self, record: ResultRecord) {
        // No receiver only means nobody renders history
        let _ = self.results.send(record);
    }

    fn end_item(&self) {
        self.current_item.send_replace(None);
        self.progress.reset();
        self.set_state(WorkerState::Idle);
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(from = %previous, to = %state, "Worker state");
        }
    }
}

fn log_report(action: &str, reply: SessionResult<Ack>) {
    match reply {
        Ok(Ack::Accepted) => debug!(action, "Reported"),
        Ok(Ack::Inactive) => info!(action, "Item already inactive on the backend"),
        Err(RetryError::Cancelled(state)) => debug!(action, %state, "Report skipped"),
        Err(error) => warn!(action, error = %error, "Report failed"),
    }
}

fn cancelled_state(error: &RetryError<TransferError>) -> Option<RunState> {
    match error {
        RetryError::Cancelled(Cancelled(state)) => Some(*state),
        other => match other.inner() {
            Some(TransferError::Cancelled(Cancelled(state))) => Some(*state),
            _ => None,
        },
    }
}

pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".");
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial file"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
