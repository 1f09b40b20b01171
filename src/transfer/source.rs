//! Where a worker gets its next item from

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::backend::session::SessionResult;
use crate::backend::{BackendSession, TransferItem};

#[derive(Debug)]
pub enum Polled {
    Item(TransferItem),
    /// Nothing pending right now; poll again later
    Empty,
    /// Nothing will ever be pending again; the worker may exit
    Exhausted,
}

#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn poll(&self, session: &BackendSession) -> SessionResult<Polled>;
}

/// Daemon mode: lease items from the backend queue, forever
#[derive(Debug, Default)]
pub struct BackendSource;

#[async_trait]
impl ItemSource for BackendSource {
    async fn poll(&self, session: &BackendSession) -> SessionResult<Polled> {
        Ok(match session.next().await? {
            Some(item) => Polled::Item(item),
            None => Polled::Empty,
        })
    }
}

/// Job mode: drain a list fetched once at startup
#[derive(Debug, Default)]
pub struct JobSource {
    pending: Mutex<VecDeque<TransferItem>>,
}

impl JobSource {
    pub fn new(items: impl IntoIterator<Item = TransferItem>) -> Self {
        Self {
            pending: Mutex::new(items.into_iter().collect()),
        }
    }

    pub async fn remaining(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl ItemSource for JobSource {
    async fn poll(&self, _session: &BackendSession) -> SessionResult<Polled> {
        Ok(match self.pending.lock().await.pop_front() {
            Some(item) => Polled::Item(item),
            None => Polled::Exhausted,
        })
    }
}
