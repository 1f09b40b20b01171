//! Rolling history of finished items, logged as a table

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::humanize::{ByteSize, human_duration};
use crate::run_state::RunStateWatcher;
use crate::transfer::{ActiveTransfer, ResultRecord, WorkerMonitor};

const TITLE: &str = "############## DOWNLOAD HISTORY #################";
const ACTIVE_TITLE: &str = "##### ACTIVE DOWNLOADS #####";
const SPACER: &str = "  ";

/// Drains worker results and keeps the newest `capacity` of them
///
/// The feeding channel is a `broadcast` of the same capacity: a slow
/// reporter loses the oldest records, never blocks a worker.
pub struct HistoryReporter {
    receiver: broadcast::Receiver<ResultRecord>,
    records: VecDeque<ResultRecord>,
    capacity: usize,
    interval: Duration,
    run_state: RunStateWatcher,
    last_rendered: Option<String>,
    monitors: Vec<WorkerMonitor>,
}

impl HistoryReporter {
    pub fn new(
        receiver: broadcast::Receiver<ResultRecord>,
        capacity: usize,
        interval: Duration,
        run_state: RunStateWatcher,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            receiver,
            records: VecDeque::with_capacity(capacity),
            capacity,
            interval,
            run_state,
            last_rendered: None,
            monitors: Vec::new(),
        }
    }

    /// Workers whose in-flight items are listed on every tick
    pub fn with_monitors(mut self, monitors: Vec<WorkerMonitor>) -> Self {
        self.monitors = monitors;
        self
    }

    pub fn active(&self) -> Vec<ActiveTransfer> {
        self.monitors.iter().filter_map(WorkerMonitor::active).collect()
    }

    pub fn push(&mut self, record: ResultRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn records(&self) -> impl Iterator<Item = &ResultRecord> {
        self.records.iter()
    }

    /// Table of the kept records, newest first; `None` while empty
    pub fn render(&self) -> Option<String> {
        if self.records.is_empty() {
            return None;
        }
        Some(render_table(self.records.iter().rev()))
    }

    /// Like [`HistoryReporter::render`] but only when the table differs
    /// from the last one returned
    pub fn render_if_changed(&mut self) -> Option<String> {
        let table = self.render()?;
        if self.last_rendered.as_deref() == Some(table.as_str()) {
            return None;
        }
        self.last_rendered = Some(table.clone());
        Some(table)
    }

    /// Collect and render until the run-state leaves `Running`, then log a
    /// final table. Returns the kept records, oldest first.
    pub async fn run(mut self) -> Vec<ResultRecord> {
        // `interval` panics on a zero period
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.run_state.stopped() => break,
                received = self.receiver.recv() => match received {
                    Ok(record) => self.push(record),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "History fell behind, oldest records dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if let Some(table) = self.render_if_changed() {
                        info!("\n{}", table);
                    }
                    self.log_active();
                }
            }
        }

        self.drain();
        if let Some(table) = self.render() {
            info!("\n{}", table);
        }
        self.records.into()
    }

    fn log_active(&self) {
        let active = self.active();
        if active.is_empty() {
            debug!("No active transfers");
        } else {
            info!("\n{}", render_active(&active));
        }
    }

    fn drain(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(record) => self.push(record),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }
}

/// One block per worker with an item, in worker order
///
/// ```text
/// ##### ACTIVE DOWNLOADS #####
/// Job 00208 Task 010 - 45% (64.00MB/137.51MB) - worker-0 Transferring
///     cental/a1.exr
/// ```
pub fn render_active(active: &[ActiveTransfer]) -> String {
    let mut lines = vec![ACTIVE_TITLE.to_string()];
    for transfer in active {
        lines.push(format!(
            "Job {} Task {} - {}% ({}/{}) - {} {}",
            transfer.item.job_id,
            transfer.item.task_id,
            transfer.percent(),
            ByteSize(transfer.bytes).to_human_readable(),
            ByteSize(transfer.item.size).to_human_readable(),
            transfer.worker,
            transfer.state,
        ));
        lines.push(format!("    {}", transfer.item.relative_path));
    }
    lines.join("\n")
}

pub fn render_table<'a>(records: impl Iterator<Item = &'a ResultRecord>) -> String {
    let header = [
        format!("{:<19}", "COMPLETED AT"),
        format!("{:<16}", "DOWNLOAD ID"),
        format!("{:<5}", "JOB"),
        format!("{:<4}", "TASK"),
        format!("{:>9}", "SIZE"),
        format!("{:<6}", "ACTION"),
        format!("{:<8}", "DURATION"),
        format!("{:<9}", "WORKER"),
        "FILEPATH".to_string(),
    ]
    .join(SPACER);

    let mut lines = vec![TITLE.to_string(), header];
    lines.extend(records.map(render_row));
    lines.join("\n")
}

fn render_row(record: &ResultRecord) -> String {
    let completed_at = record
        .completed_at
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    let path = record
        .path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();

    [
        format!("{:<19}", completed_at),
        format!("{:<16}", record.id),
        format!("{:<5}", record.job_id),
        format!("{:<4}", record.task_id),
        format!("{:>9}", ByteSize(record.size).to_human_readable()),
        format!("{:<6}", record.outcome.action()),
        format!("{:<8}", human_duration(record.duration())),
        format!("{:<9}", record.worker),
        path,
    ]
    .join(SPACER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state;
    use crate::transfer::Outcome;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn record(id: &str, outcome: Outcome) -> ResultRecord {
        ResultRecord {
            id: id.to_string(),
            job_id: "00208".to_string(),
            task_id: "010".to_string(),
            size: 144_187_064,
            outcome,
            started_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            completed_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 5).unwrap(),
            worker: "worker-1".to_string(),
            path: Some(PathBuf::from("/renders/cental.010.exr")),
        }
    }

    fn reporter(capacity: usize) -> (broadcast::Sender<ResultRecord>, HistoryReporter, run_state::RunStateController) {
        let (tx, rx) = broadcast::channel(capacity);
        let (controller, watcher) = run_state::channel();
        let reporter = HistoryReporter::new(rx, capacity, Duration::from_secs(10), watcher);
        (tx, reporter, controller)
    }

    #[test]
    fn test_ring_keeps_newest() {
        let (_tx, mut reporter, _controller) = reporter(3);
        for i in 0..5 {
            reporter.push(record(&format!("id-{}", i), Outcome::Downloaded));
        }
        let ids: Vec<_> = reporter.records().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["id-2", "id-3", "id-4"]);
    }

    #[test]
    fn test_render_newest_first() {
        let (_tx, mut reporter, _controller) = reporter(10);
        assert!(reporter.render().is_none());

        reporter.push(record("first", Outcome::Reused));
        reporter.push(record("second", Outcome::Failed));

        let table = reporter.render().unwrap();
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines[0], TITLE);
        assert!(lines[1].starts_with("COMPLETED AT"));
        assert!(lines[2].contains("second"));
        assert!(lines[2].contains("FAILED"));
        assert!(lines[2].contains("0:01:05"));
        assert!(lines[2].contains("137.51MB"));
        assert!(lines[3].contains("REUSED"));
        assert!(lines[3].ends_with("/renders/cental.010.exr"));
    }

    #[test]
    fn test_render_only_when_changed() {
        let (_tx, mut reporter, _controller) = reporter(10);
        assert!(reporter.render_if_changed().is_none());

        reporter.push(record("a1", Outcome::Downloaded));
        assert!(reporter.render_if_changed().is_some());
        assert!(reporter.render_if_changed().is_none());

        reporter.push(record("b2", Outcome::Downloaded));
        assert!(reporter.render_if_changed().is_some());
    }

    #[test]
    fn test_render_active() {
        use crate::backend::TransferItem;
        use crate::transfer::WorkerState;
        use std::sync::Arc;

        let active = vec![ActiveTransfer {
            worker: "worker-0".to_string(),
            state: WorkerState::Transferring,
            item: Arc::new(TransferItem {
                id: "a1".to_string(),
                job_id: "00208".to_string(),
                task_id: "010".to_string(),
                url: "https://storage.example.com/a1".to_string(),
                relative_path: "cental/a1.exr".to_string(),
                output_dir: None,
                size: 4 * 1024 * 1024,
                md5: String::new(),
            }),
            bytes: 1024 * 1024,
        }];

        let rendered = render_active(&active);
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines[0], ACTIVE_TITLE);
        assert_eq!(
            lines[1],
            "Job 00208 Task 010 - 25% (1.00MB/4.00MB) - worker-0 Transferring"
        );
        assert_eq!(lines[2], "    cental/a1.exr");
    }

    #[tokio::test]
    async fn test_run_collects_until_stopped() {
        let (tx, reporter, controller) = reporter(100);
        let handle = tokio::spawn(reporter.run());

        tx.send(record("a1", Outcome::Downloaded)).unwrap();
        tx.send(record("b2", Outcome::Reused)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.stop();

        let records = handle.await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "b2"]);
    }

    #[tokio::test]
    async fn test_zero_interval_does_not_kill_reporter() {
        let (tx, rx) = broadcast::channel(4);
        let (controller, watcher) = run_state::channel();
        let reporter = HistoryReporter::new(rx, 4, Duration::ZERO, watcher);
        let handle = tokio::spawn(reporter.run());

        tx.send(record("a1", Outcome::Downloaded)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.stop();

        assert_eq!(handle.await.unwrap().len(), 1);
    }
}
