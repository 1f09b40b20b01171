use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte progress of the in-flight item
///
/// Written by the worker, read by its heartbeat. `updates` counts writes for
/// the lifetime of the worker and never goes back, so the reader can tell
/// "advanced" from "unchanged" across rehashes and retries of one item.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    bytes: AtomicU64,
    updates: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub bytes: u64,
    pub updates: u64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.inner.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.inner.updates.fetch_add(1, Ordering::Release);
    }

    pub fn set(&self, bytes: u64) {
        self.inner.bytes.store(bytes, Ordering::Relaxed);
        self.inner.updates.fetch_add(1, Ordering::Release);
    }

    /// Start of a new item or attempt; `updates` keeps counting
    pub fn reset(&self) {
        self.inner.bytes.store(0, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.inner.bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let updates = self.inner.updates.load(Ordering::Acquire);
        ProgressSnapshot {
            bytes: self.inner.bytes.load(Ordering::Relaxed),
            updates,
        }
    }
}
