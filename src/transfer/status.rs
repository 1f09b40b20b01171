//! Live view of what each worker is doing

use std::sync::Arc;
use tokio::sync::watch;

use super::progress::Progress;
use super::worker::WorkerState;
use crate::backend::TransferItem;

/// The item a worker is on, announced through a `watch` channel
#[derive(Debug, Clone)]
pub struct CurrentItem {
    pub item: Arc<TransferItem>,
    /// [`Progress`] update count when the worker picked the item up
    pub baseline: u64,
}

/// Read side of one worker: its state, its item and its progress
#[derive(Clone)]
pub struct WorkerMonitor {
    name: String,
    state: watch::Receiver<WorkerState>,
    current: watch::Receiver<Option<CurrentItem>>,
    progress: Progress,
}

impl WorkerMonitor {
    pub(crate) fn new(
        name: String,
        state: watch::Receiver<WorkerState>,
        current: watch::Receiver<Option<CurrentItem>>,
        progress: Progress,
    ) -> Self {
        Self {
            name,
            state,
            current,
            progress,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// `None` while the worker has no item
    pub fn active(&self) -> Option<ActiveTransfer> {
        let current = self.current.borrow().clone()?;
        Some(ActiveTransfer {
            worker: self.name.clone(),
            state: self.state(),
            item: current.item,
            bytes: self.progress.bytes(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    pub worker: String,
    pub state: WorkerState,
    pub item: Arc<TransferItem>,
    /// Bytes hashed or written so far in the current attempt
    pub bytes: u64,
}

impl ActiveTransfer {
    /// Whole percent of the expected size, capped at 100
    pub fn percent(&self) -> u64 {
        if self.item.size == 0 {
            return 100;
        }
        (self.bytes.saturating_mul(100) / self.item.size).min(100)
    }
}
