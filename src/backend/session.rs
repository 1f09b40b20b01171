use std::sync::Arc;

use super::error::BackendError;
use super::models::{Filters, TransferItem};
use super::{Ack, Backend};
use crate::retry::{RetryError, RetryPolicy};
use crate::run_state::RunStateWatcher;

pub type SessionResult<T> = std::result::Result<T, RetryError<BackendError>>;

/// A worker's view of the backend: every call retried on 5xx and network
/// errors, with backoff sleeps cut short by the worker's run-state
#[derive(Clone)]
pub struct BackendSession {
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
    run_state: RunStateWatcher,
    filters: Arc<Filters>,
}

impl BackendSession {
    pub fn new(
        backend: Arc<dyn Backend>,
        policy: RetryPolicy,
        run_state: RunStateWatcher,
        filters: Arc<Filters>,
    ) -> Self {
        Self {
            backend,
            policy,
            run_state,
            filters,
        }
    }

    pub async fn next(&self) -> SessionResult<Option<TransferItem>> {
        self.policy
            .run_classified(&self.run_state, |_| self.backend.next(&self.filters))
            .await
    }

    pub async fn touch(&self, id: &str, bytes: u64) -> SessionResult<Ack> {
        self.policy
            .run_classified(&self.run_state, |_| {
                self.backend.touch(id, bytes, &self.filters)
            })
            .await
    }

    pub async fn finish(&self, id: &str, bytes: u64) -> SessionResult<Ack> {
        self.policy
            .run_classified(&self.run_state, |_| {
                self.backend.finish(id, bytes, &self.filters)
            })
            .await
    }

    pub async fn fail(&self, id: &str, bytes: u64) -> SessionResult<Ack> {
        self.policy
            .run_classified(&self.run_state, |_| {
                self.backend.fail(id, bytes, &self.filters)
            })
            .await
    }

    pub async fn job_items(
        &self,
        job_id: &str,
        task_id: Option<&str>,
    ) -> SessionResult<Vec<TransferItem>> {
        self.policy
            .run_classified(&self.run_state, |_| self.backend.job_items(job_id, task_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Result;
    use crate::retry::Backoff;
    use crate::run_state;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails `next` with 503 a fixed number of times, then returns nothing
    struct FlakyBackend {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn next(&self, _filters: &Filters) -> Result<Option<TransferItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BackendError::Status {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: String::new(),
                });
            }
            Ok(None)
        }

        async fn touch(&self, _id: &str, _bytes: u64, _filters: &Filters) -> Result<Ack> {
            Ok(Ack::Accepted)
        }

        async fn finish(&self, _id: &str, _bytes: u64, _filters: &Filters) -> Result<Ack> {
            Err(BackendError::Status {
                status: StatusCode::BAD_REQUEST,
                body: String::new(),
            })
        }

        async fn fail(&self, _id: &str, _bytes: u64, _filters: &Filters) -> Result<Ack> {
            Ok(Ack::Inactive)
        }

        async fn job_items(&self, _job_id: &str, _task_id: Option<&str>) -> Result<Vec<TransferItem>> {
            Ok(Vec::new())
        }
    }

    fn session(backend: Arc<FlakyBackend>) -> (run_state::RunStateController, BackendSession) {
        let (controller, watcher) = run_state::channel();
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(1)));
        let session = BackendSession::new(backend, policy, watcher, Arc::new(Filters::default()));
        (controller, session)
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let backend = Arc::new(FlakyBackend {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let (_controller, session) = session(backend.clone());

        assert!(session.next().await.unwrap().is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_capped_at_tries() {
        let backend = Arc::new(FlakyBackend {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        });
        let (_controller, session) = session(backend.clone());

        let error = session.next().await.unwrap_err();
        assert!(matches!(error, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_fail_fast() {
        let backend = Arc::new(FlakyBackend {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let (_controller, session) = session(backend);

        assert!(matches!(
            session.finish("a1", 10).await,
            Err(RetryError::Rejected(BackendError::Status { .. }))
        ));
        assert_eq!(session.fail("a1", 0).await.unwrap(), Ack::Inactive);
    }
}
