//! Owns the worker pool and the history reporter, and runs shutdown

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, BackendSession, Filters};
use crate::config::Config;
use crate::history::HistoryReporter;
use crate::humanize::{ByteSize, human_duration};
use crate::observability::{Metrics, MetricsSnapshot};
use crate::retry::{RetryError, RetryPolicy};
use crate::run_state::{self, RunStateController};
use crate::transfer::{
    ActiveTransfer, BackendSource, ItemSource, JobSource, ResultRecord, SourceFetcher,
    TransferWorker, WorkerMonitor, WorkerSettings, WorkerShared,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("cannot prepare output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot list items of job {job_id}: {source}")]
    JobListing {
        job_id: String,
        #[source]
        source: RetryError<BackendError>,
    },
}

/// Where workers get items from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Poll the backend queue until stopped
    Daemon,
    /// Transfer every item of the given jobs, then exit
    Jobs {
        job_ids: Vec<String>,
        task_id: Option<String>,
    },
}

pub struct Orchestrator {
    config: Config,
    backend: Arc<dyn Backend>,
    fetcher: Arc<dyn SourceFetcher>,
}

impl Orchestrator {
    pub fn new(config: Config, backend: Arc<dyn Backend>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            config,
            backend,
            fetcher,
        }
    }

    /// Spawn `thread_count` workers plus the history reporter
    ///
    /// Only setup failures surface here; per-item errors stay inside workers.
    pub async fn start(self, mode: Mode) -> Result<DaemonHandle, OrchestratorError> {
        let run_id = Uuid::now_v7();
        let span = info_span!("run", %run_id);
        let started = Instant::now();

        let worker_config = &self.config.worker;
        if let Some(path) = &worker_config.output_dir {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|source| OrchestratorError::OutputDir {
                    path: path.clone(),
                    source,
                })?;
        }

        let filters = Arc::new(Filters::from(&self.config.filters));
        let backend_policy = RetryPolicy::from_config(self.config.backend.tries, &self.config.retry);

        let source: Arc<dyn ItemSource> = match &mode {
            Mode::Daemon => Arc::new(BackendSource),
            Mode::Jobs { job_ids, task_id } => {
                let (_startup, watcher) = run_state::channel();
                let session = BackendSession::new(
                    self.backend.clone(),
                    backend_policy.clone(),
                    watcher,
                    filters.clone(),
                );
                let mut items = Vec::new();
                for job_id in job_ids {
                    let listed = session
                        .job_items(job_id, task_id.as_deref())
                        .await
                        .map_err(|source| OrchestratorError::JobListing {
                            job_id: job_id.clone(),
                            source,
                        })?;
                    info!(parent: &span, job_id = %job_id, items = listed.len(), "Listed job items");
                    items.extend(listed);
                }
                let jobs = JobSource::new(items);
                info!(parent: &span, pending = jobs.remaining().await, "Job items queued");
                Arc::new(jobs)
            }
        };

        let metrics = Arc::new(Metrics::new());
        let capacity = self.config.history.capacity.max(1);
        let (results, history_rx) = broadcast::channel::<ResultRecord>(capacity);

        let shared = WorkerShared {
            backend: self.backend,
            backend_policy,
            item_policy: RetryPolicy::from_config(worker_config.max_attempts, &self.config.retry),
            filters,
            source,
            fetcher: self.fetcher,
            results,
            metrics: metrics.clone(),
        };
        let settings = WorkerSettings::from(worker_config);

        let mut controllers = Vec::with_capacity(worker_config.thread_count);
        let mut monitors = Vec::with_capacity(worker_config.thread_count);
        let mut workers = JoinSet::new();
        for index in 0..worker_config.thread_count {
            let (controller, watcher) = run_state::channel();
            let worker = TransferWorker::new(
                format!("worker-{}", index),
                settings.clone(),
                shared.clone(),
                watcher,
            );
            monitors.push(worker.monitor());
            controllers.push(controller);
            workers.spawn(worker.run().instrument(span.clone()));
        }
        // Workers hold the only senders now, so history sees `Closed` once they are gone
        drop(shared);

        let (history_controller, history_watcher) = run_state::channel();
        let history = HistoryReporter::new(
            history_rx,
            capacity,
            self.config.history.interval(),
            history_watcher,
        )
        .with_monitors(monitors.clone());
        let history = tokio::spawn(history.run().instrument(span.clone()));

        info!(
            parent: &span,
            workers = worker_config.thread_count,
            mode = ?mode,
            "Transfer daemon started"
        );

        Ok(DaemonHandle {
            run_id,
            started,
            controls: Arc::new(Controls {
                workers: controllers,
                history: history_controller,
            }),
            workers,
            history: Some(history),
            monitors,
            metrics,
            span,
        })
    }
}

struct Controls {
    workers: Vec<RunStateController>,
    history: RunStateController,
}

impl Controls {
    fn stop_workers(&self) {
        for controller in &self.workers {
            controller.stop();
        }
    }

    fn kill(&self) {
        for controller in &self.workers {
            controller.kill();
        }
        self.history.kill();
    }
}

/// Forces every unit owned by a [`DaemonHandle`] to `Killed`
#[derive(Clone)]
pub struct KillSwitch(Arc<Controls>);

impl KillSwitch {
    pub fn kill(&self) {
        self.0.kill();
    }
}

/// What the run did, returned by [`DaemonHandle::shutdown`]
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub uptime: Duration,
    pub metrics: MetricsSnapshot,
    pub history: Vec<ResultRecord>,
}

pub struct DaemonHandle {
    run_id: Uuid,
    started: Instant,
    controls: Arc<Controls>,
    workers: JoinSet<()>,
    history: Option<JoinHandle<Vec<ResultRecord>>>,
    monitors: Vec<WorkerMonitor>,
    metrics: Arc<Metrics>,
    span: tracing::Span,
}

impl DaemonHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Items the workers are on right now, in worker order
    pub fn active_transfers(&self) -> Vec<ActiveTransfer> {
        self.monitors.iter().filter_map(WorkerMonitor::active).collect()
    }

    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch(self.controls.clone())
    }

    /// Ask every worker to stop taking work; does not wait
    pub fn signal_stop(&self) {
        info!(parent: &self.span, "Stopping workers");
        self.controls.stop_workers();
    }

    /// Abort everything as fast as possible; does not wait
    pub fn kill(&self) {
        warn!(parent: &self.span, "Killing workers");
        self.controls.kill();
    }

    /// Resolves when every worker has exited on its own
    ///
    /// Cancel-safe: dropping the future leaves unfinished workers in place.
    pub async fn wait(&mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(parent: &self.span, error = %e, "Worker task ended abnormally");
            }
        }
    }

    /// Stop workers, join them, then stop the history reporter and log the run
    pub async fn shutdown(mut self) -> RunSummary {
        self.signal_stop();
        self.wait().await;

        self.controls.history.stop();
        let history = match self.history.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                error!(parent: &self.span, error = %e, "History reporter ended abnormally");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let uptime = self.started.elapsed();
        let metrics = self.metrics.snapshot();
        info!(
            parent: &self.span,
            uptime = %human_duration(uptime),
            downloaded = metrics.items_downloaded,
            reused = metrics.items_reused,
            failed = metrics.items_failed,
            abandoned = metrics.items_abandoned,
            bytes = %ByteSize(metrics.bytes_downloaded),
            "Transfer daemon stopped"
        );

        RunSummary {
            run_id: self.run_id,
            uptime,
            metrics,
            history,
        }
    }
}
