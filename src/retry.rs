//! Retry with exponential backoff, interruptible by the run-state

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::run_state::{Cancelled, RunStateWatcher};

/// Closed set of failure categories, assigned once where the error is raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network timeouts, 5xx, momentary disk errors
    Transient,
    /// Content did not match the expected digest or size
    Integrity,
    /// Retrying cannot help; report and move on
    Terminal,
    /// Unexpected failure inside the worker loop
    Fatal,
    /// Run-state left `Running`
    Shutdown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Integrity)
    }
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("not retryable: {0}")]
    Rejected(#[source] E),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// The last error returned by the operation, if it ran at all
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Rejected(source) => Some(source),
            RetryError::Cancelled(_) => None,
        }
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Rejected(source) => Some(source),
            RetryError::Cancelled(_) => None,
        }
    }
}

/// Delay before the next attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// `base * 2^(failures - 1)` capped at `max`; with `jitter`, a uniform
    /// pick in `[0, capped]`
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
    Fixed(Duration),
}

impl Backoff {
    /// `failures` counts failed attempts so far, starting at 1
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max, jitter } => {
                let exponent = failures.saturating_sub(1);
                let capped = base
                    .saturating_mul(2_u32.saturating_pow(exponent))
                    .min(*max);
                if *jitter && !capped.is_zero() {
                    let millis = capped.as_millis() as u64;
                    Duration::from_millis(rand::rng().random_range(0..=millis))
                } else {
                    capped
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Jittered exponential policy from the `[retry]` config section
    pub fn from_config(max_attempts: u32, config: &RetryConfig) -> Self {
        Self::new(
            max_attempts,
            Backoff::Exponential {
                base: config.base_delay(),
                max: config.max_delay(),
                jitter: true,
            },
        )
    }

    /// Run `op` until it succeeds, `retryable` rejects its error, or attempts run out
    ///
    /// The first attempt always runs. Sleeps between attempts end early when
    /// `run_state` leaves `Running`, yielding [`RetryError::Cancelled`].
    pub async fn run<T, E, F, Fut, P>(
        &self,
        run_state: &RunStateWatcher,
        retryable: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !retryable(&error) => {
                    return Err(RetryError::Rejected(error));
                }
                Err(error) if attempt >= self.max_attempts => {
                    warn!(attempt, error = %error, "Giving up after final attempt");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: error,
                    });
                }
                Err(error) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    run_state.sleep(delay).await?;
                }
            }
        }
    }

    /// [`RetryPolicy::run`] using the error's own [`Classify`] verdict
    pub async fn run_classified<T, E, F, Fut>(
        &self,
        run_state: &RunStateWatcher,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + Classify + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(run_state, |error: &E| error.is_retryable(), op)
            .await
    }
}
