//! Cooperative run-state shared from the orchestrator down to every worker
//!
//! Each spawned unit receives a [`RunStateWatcher`]; the orchestrator keeps
//! the matching [`RunStateController`]. Transitions only move forward:
//! `Running -> Stopping -> Killed`.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Running,
    /// Finish the current step, clean up, take no new work
    Stopping,
    /// Abort as fast as possible, skip cleanup and final reports
    Killed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Killed => "killed",
        };
        f.write_str(label)
    }
}

/// Raised when work observes that the run-state left `Running`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run state changed to {0}")]
pub struct Cancelled(pub RunState);

/// Create a controller/watcher pair starting at `Running`
pub fn channel() -> (RunStateController, RunStateWatcher) {
    let (tx, rx) = watch::channel(RunState::Running);
    (RunStateController { tx }, RunStateWatcher { rx })
}

#[derive(Debug)]
pub struct RunStateController {
    tx: watch::Sender<RunState>,
}

impl RunStateController {
    pub fn state(&self) -> RunState {
        *self.tx.borrow()
    }

    /// `Running -> Stopping`; no-op otherwise
    pub fn stop(&self) -> bool {
        self.advance(RunState::Stopping)
    }

    /// Any state -> `Killed`
    pub fn kill(&self) -> bool {
        self.advance(RunState::Killed)
    }

    pub fn watcher(&self) -> RunStateWatcher {
        RunStateWatcher {
            rx: self.tx.subscribe(),
        }
    }

    fn advance(&self, next: RunState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current < next {
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunStateWatcher {
    rx: watch::Receiver<RunState>,
}

impl RunStateWatcher {
    pub fn current(&self) -> RunState {
        *self.rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.current() == RunState::Running
    }

    pub fn ensure_running(&self) -> Result<(), Cancelled> {
        match self.current() {
            RunState::Running => Ok(()),
            other => Err(Cancelled(other)),
        }
    }

    /// Resolves once the state leaves `Running`
    ///
    /// Never resolves if the controller is gone, since nothing can stop us then.
    pub async fn stopped(&self) -> RunState {
        let mut rx = self.rx.clone();
        let result = rx
            .wait_for(|state| *state != RunState::Running)
            .await
            .map(|state| *state);
        match result {
            Ok(state) => state,
            Err(_) => std::future::pending().await,
        }
    }

    /// Sleep that wakes early when the run-state leaves `Running`
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.ensure_running()?;
        tokio::select! {
            state = self.stopped() => Err(Cancelled(state)),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_transitions_only_move_forward() {
        let (controller, watcher) = channel();
        assert!(watcher.is_running());

        assert!(controller.stop());
        assert_eq!(watcher.current(), RunState::Stopping);
        assert!(!controller.stop());

        assert!(controller.kill());
        assert_eq!(watcher.current(), RunState::Killed);
        assert!(!controller.stop());
        assert_eq!(controller.state(), RunState::Killed);
    }

    #[test]
    fn test_ensure_running() {
        let (controller, watcher) = channel();
        assert!(watcher.ensure_running().is_ok());
        controller.kill();
        assert_eq!(
            watcher.ensure_running(),
            Err(Cancelled(RunState::Killed))
        );
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_stop() {
        let (controller, watcher) = channel();

        let started = Instant::now();
        let sleeper = tokio::spawn(async move { watcher.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.stop();

        let result = sleeper.await.unwrap();
        assert_eq!(result, Err(Cancelled(RunState::Stopping)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_sleep_completes_while_running() {
        let (_controller, watcher) = channel();
        assert!(watcher.sleep(Duration::from_millis(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_refuses_when_already_stopped() {
        let (controller, watcher) = channel();
        controller.stop();
        assert!(watcher.sleep(Duration::from_millis(5)).await.is_err());
    }
}
