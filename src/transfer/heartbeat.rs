//! Liveness reports for a worker's in-flight item

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::progress::Progress;
use super::status::CurrentItem;
use crate::backend::{Ack, BackendSession};
use crate::retry::RetryError;
use crate::run_state::RunStateWatcher;

/// Touches the backend while its worker makes progress
///
/// One per worker. The worker announces the item it is on through
/// `current_item`; a tick without new progress sends nothing.
pub struct HeartbeatReporter {
    session: BackendSession,
    progress: Progress,
    current_item: watch::Receiver<Option<CurrentItem>>,
    run_state: RunStateWatcher,
    interval: Duration,
    watermark: Watermark,
}

#[derive(Debug, Default)]
struct Watermark {
    item: Option<String>,
    updates: u64,
    /// Backend answered 410 for this item
    inactive: bool,
}

impl HeartbeatReporter {
    pub fn new(
        session: BackendSession,
        progress: Progress,
        current_item: watch::Receiver<Option<CurrentItem>>,
        run_state: RunStateWatcher,
        interval: Duration,
    ) -> Self {
        Self {
            session,
            progress,
            current_item,
            run_state,
            interval,
            watermark: Watermark::default(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.run_state.stopped() => break,
                _ = ticker.tick() => {
                    self.beat().await;
                }
            }
        }
        debug!("Heartbeat stopped");
    }

    /// One tick; returns the backend's answer when a touch was sent
    pub async fn beat(&mut self) -> Option<Ack> {
        if self.current_item.has_changed().unwrap_or(false) {
            self.watermark = match &*self.current_item.borrow_and_update() {
                Some(current) => Watermark {
                    item: Some(current.item.id.clone()),
                    updates: current.baseline,
                    inactive: false,
                },
                None => Watermark::default(),
            };
        }

        let item_id = self.watermark.item.clone()?;
        if self.watermark.inactive {
            return None;
        }

        let snapshot = self.progress.snapshot();
        if snapshot.updates == self.watermark.updates {
            return None;
        }
        self.watermark.updates = snapshot.updates;

        match self.session.touch(&item_id, snapshot.bytes).await {
            Ok(Ack::Accepted) => {
                debug!(item_id = %item_id, bytes = snapshot.bytes, "Touched");
                Some(Ack::Accepted)
            }
            Ok(Ack::Inactive) => {
                info!(item_id = %item_id, "Item no longer active, heartbeat paused for it");
                self.watermark.inactive = true;
                Some(Ack::Inactive)
            }
            Err(RetryError::Cancelled(_)) => None,
            Err(error) => {
                warn!(item_id = %item_id, error = %error, "Heartbeat failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Filters, Result, TransferItem};
    use crate::retry::{Backoff, RetryPolicy};
    use crate::run_state;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    fn announce(f: &Fixture, id: &str) {
        let item = TransferItem {
            id: id.to_string(),
            job_id: "00208".to_string(),
            task_id: "010".to_string(),
            url: format!("https://storage.example.com/{}", id),
            relative_path: format!("cental/{}.exr", id),
            output_dir: None,
            size: 4096,
            md5: String::new(),
        };
        f.item_tx.send_replace(Some(CurrentItem {
            item: Arc::new(item),
            baseline: f.progress.snapshot().updates,
        }));
    }

    #[derive(Default)]
    struct RecordingBackend {
        touches: Mutex<Vec<(String, u64)>>,
        gone: bool,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn next(&self, _filters: &Filters) -> Result<Option<TransferItem>> {
            Ok(None)
        }

        async fn touch(&self, id: &str, bytes: u64, _filters: &Filters) -> Result<Ack> {
            self.touches.lock().unwrap().push((id.to_string(), bytes));
            Ok(if self.gone { Ack::Inactive } else { Ack::Accepted })
        }

        async fn finish(&self, _id: &str, _bytes: u64, _filters: &Filters) -> Result<Ack> {
            Ok(Ack::Accepted)
        }

        async fn fail(&self, _id: &str, _bytes: u64, _filters: &Filters) -> Result<Ack> {
            Ok(Ack::Accepted)
        }

        async fn job_items(&self, _job_id: &str, _task_id: Option<&str>) -> Result<Vec<TransferItem>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        backend: Arc<RecordingBackend>,
        progress: Progress,
        item_tx: watch::Sender<Option<CurrentItem>>,
        reporter: HeartbeatReporter,
        controller: run_state::RunStateController,
    }

    fn fixture(gone: bool) -> Fixture {
        let backend = Arc::new(RecordingBackend {
            gone,
            ..Default::default()
        });
        let (controller, watcher) = run_state::channel();
        let session = BackendSession::new(
            backend.clone(),
            RetryPolicy::new(1, Backoff::Fixed(Duration::ZERO)),
            watcher.clone(),
            Arc::new(Filters::default()),
        );
        let progress = Progress::new();
        let (item_tx, item_rx) = watch::channel(None);
        let reporter = HeartbeatReporter::new(
            session,
            progress.clone(),
            item_rx,
            watcher,
            Duration::from_secs(10),
        );
        Fixture {
            backend,
            progress,
            item_tx,
            reporter,
            controller,
        }
    }

    #[tokio::test]
    async fn test_no_touch_without_item() {
        let mut f = fixture(false);
        f.progress.add(10);
        assert_eq!(f.reporter.beat().await, None);
        assert!(f.backend.touches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch_only_when_progress_advanced() {
        let mut f = fixture(false);
        announce(&f, "a1");

        // Nothing written yet
        assert_eq!(f.reporter.beat().await, None);

        f.progress.add(512);
        f.progress.add(512);
        assert_eq!(f.reporter.beat().await, Some(Ack::Accepted));

        // Idle tick
        assert_eq!(f.reporter.beat().await, None);

        f.progress.add(100);
        assert_eq!(f.reporter.beat().await, Some(Ack::Accepted));

        let touches = f.backend.touches.lock().unwrap().clone();
        assert_eq!(
            touches,
            vec![("a1".to_string(), 1024), ("a1".to_string(), 1124)]
        );
    }

    #[tokio::test]
    async fn test_inactive_item_is_not_touched_again() {
        let mut f = fixture(true);
        announce(&f, "a1");

        f.progress.add(1);
        assert_eq!(f.reporter.beat().await, Some(Ack::Inactive));
        f.progress.add(1);
        assert_eq!(f.reporter.beat().await, None);

        // A new item resets the watermark
        f.progress.reset();
        announce(&f, "b2");
        f.progress.add(5);
        assert_eq!(f.reporter.beat().await, Some(Ack::Inactive));
        assert_eq!(f.backend.touches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_of_same_item_is_touched() {
        let mut f = fixture(false);
        announce(&f, "a1");

        for _ in 0..3 {
            f.progress.add(256);
        }
        assert_eq!(f.reporter.beat().await, Some(Ack::Accepted));

        // The worker starts another attempt on the same item
        f.progress.reset();
        for _ in 0..3 {
            f.progress.add(256);
        }
        assert_eq!(f.reporter.beat().await, Some(Ack::Accepted));

        let touches = f.backend.touches.lock().unwrap().clone();
        assert_eq!(touches, vec![("a1".to_string(), 768), ("a1".to_string(), 768)]);
    }

    #[tokio::test]
    async fn test_new_item_ignores_earlier_progress() {
        let mut f = fixture(false);
        announce(&f, "a1");
        f.progress.add(100);
        assert_eq!(f.reporter.beat().await, Some(Ack::Accepted));

        f.progress.reset();
        announce(&f, "b2");
        assert_eq!(f.reporter.beat().await, None);

        f.progress.add(10);
        assert_eq!(f.reporter.beat().await, Some(Ack::Accepted));
        assert_eq!(f.backend.touches.lock().unwrap().last().unwrap().0, "b2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_stop() {
        let f = fixture(false);
        let controller = f.controller;
        let handle = tokio::spawn(f.reporter.run());

        tokio::time::sleep(Duration::from_secs(25)).await;
        controller.stop();
        handle.await.unwrap();
        assert!(f.backend.touches.lock().unwrap().is_empty());
    }
}
