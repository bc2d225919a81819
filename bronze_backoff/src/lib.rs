//! Bounded exponential backoff for calls to external systems.
//!
//! Every call the pipeline makes to a database, channel or object store goes through
//! [`Backoff::retry`]: each attempt runs under a deadline, transient failures are retried with a
//! jittered, exponentially growing delay, and the attempt budget is finite so a failing
//! dependency surfaces as an error instead of a hung task.

use std::{future::Future, time::Duration};

use observability_deps::tracing::{info, warn};
use rand::Rng;

/// Classification of an error as worth retrying.
pub trait Retryable {
    /// Returns `true` if the same call may succeed when repeated later.
    fn is_transient(&self) -> bool;
}

#[cfg(feature = "object_store")]
impl Retryable for object_store::Error {
    fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::InvalidPath { .. }
                | Self::NotSupported { .. }
                | Self::NotImplemented
                | Self::PermissionDenied { .. }
                | Self::Unauthenticated { .. }
                | Self::UnknownConfigurationKey { .. }
                | Self::AlreadyExists { .. }
                | Self::Precondition { .. }
        )
    }
}

/// Parameters of an exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub init_backoff: Duration,
    /// Upper bound of any single delay.
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after every failure.
    pub base: f64,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Deadline of a single attempt. Expiry counts as a transient failure.
    pub attempt_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 3.,
            max_attempts: 8,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a single failed attempt.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Failed(E),

    #[error("attempt did not complete within {0:?}")]
    TimedOut(Duration),
}

impl<E> AttemptError<E>
where
    E: std::error::Error + 'static,
{
    /// The underlying error, if the attempt failed rather than timing out.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            Self::TimedOut(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackoffError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{task} gave up after {attempts} attempts: {source}")]
    Exhausted {
        task: String,
        attempts: u32,
        source: AttemptError<E>,
    },

    #[error("{task} failed with a non-retryable error: {source}")]
    Permanent { task: String, source: E },
}

impl<E> BackoffError<E>
where
    E: std::error::Error + 'static,
{
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Stateful exponential backoff with decorrelated jitter.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Backoff {
    config: BackoffConfig,
    next_backoff_secs: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: *config,
            next_backoff_secs: config.init_backoff.as_secs_f64(),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Start over from the initial delay, e.g. after a success.
    pub fn reset(&mut self) {
        self.next_backoff_secs = self.config.init_backoff.as_secs_f64();
    }

    /// Returns the delay to wait before the next retry and advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let init = self.config.init_backoff.as_secs_f64();
        let max = self.config.max_backoff.as_secs_f64().max(init);

        let delay = self.next_backoff_secs.clamp(init, max);
        let upper = (delay * self.config.base).max(init);
        self.next_backoff_secs = if upper > init {
            rand::thread_rng().gen_range(init..upper).min(max)
        } else {
            init
        };

        Duration::from_secs_f64(delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// Each attempt is bounded by [`BackoffConfig::attempt_timeout`].
    pub async fn retry<F, Fut, T, E>(&mut self, task: &str, mut op: F) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: Retryable + std::error::Error + Send + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match tokio::time::timeout(self.config.attempt_timeout, op()).await {
                Ok(Ok(v)) => {
                    if attempt > 1 {
                        info!(task, attempt, "request succeeded after retrying");
                    }
                    return Ok(v);
                }
                Ok(Err(e)) if !e.is_transient() => {
                    return Err(BackoffError::Permanent {
                        task: task.to_string(),
                        source: e,
                    });
                }
                Ok(Err(e)) => AttemptError::Failed(e),
                Err(_) => AttemptError::TimedOut(self.config.attempt_timeout),
            };

            if attempt >= max_attempts {
                return Err(BackoffError::Exhausted {
                    task: task.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.next_delay();
            warn!(
                task,
                attempt,
                max_attempts,
                %error,
                backoff_ms = delay.as_millis() as u64,
                "request encountered a transient error, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
