//! Bounded exponential backoff with jitter for retrying transient failures.

use std::{future::Future, num::NonZeroUsize, time::Duration};

use rand::{Rng, SeedableRng, rngs::SmallRng};
use tracing::{info, warn};

/// Exponential backoff with jitter
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Attempts made before giving up, including the first one.
    pub max_attempts: NonZeroUsize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 3.,
            max_attempts: NonZeroUsize::new(5).expect("non-zero"),
        }
    }
}

/// Error after giving up retrying.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{task_name} failed with a non-retryable error: {source}")]
    Permanent {
        task_name: String,
        attempts: usize,
        #[source]
        source: E,
    },

    #[error("{task_name} still failing after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        task_name: String,
        attempts: usize,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Attempts made, including the failing one.
    pub fn attempts(&self) -> usize {
        match self {
            Self::Permanent { attempts, .. } | Self::RetriesExhausted { attempts, .. } => *attempts,
        }
    }

    /// Whether the last error was transient, i.e. retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    pub fn inner(&self) -> &E {
        match self {
            Self::Permanent { source, .. } | Self::RetriesExhausted { source, .. } => source,
        }
    }
}

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff interval
#[derive(Debug)]
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    max_attempts: usize,
    rng: SmallRng,
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            max_attempts: config.max_attempts.get(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Returns the next backoff duration to wait for
    pub fn next(&mut self) -> Duration {
        let low = self.init_backoff;
        let high = self.next_backoff_secs * self.base;
        let rand_backoff = if high > low {
            self.rng.gen_range(low..high)
        } else {
            low
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }

    /// Perform an async operation, retrying the errors `is_transient`
    /// accepts until the attempt budget is spent.
    ///
    /// Returns the value together with the number of attempts it took.
    pub async fn retry_with_classifier<F, Fut, T, E, C>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
        is_transient: C,
    ) -> Result<(T, usize), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        C: Fn(&E) -> bool,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let e = match do_stuff().await {
                Ok(v) => {
                    if attempts > 1 {
                        info!(task_name, attempts, "request succeeded after retrying");
                    }
                    return Ok((v, attempts));
                }
                Err(e) => e,
            };

            if !is_transient(&e) {
                return Err(RetryError::Permanent {
                    task_name: task_name.to_owned(),
                    attempts,
                    source: e,
                });
            }

            if attempts >= self.max_attempts {
                return Err(RetryError::RetriesExhausted {
                    task_name: task_name.to_owned(),
                    attempts,
                    source: e,
                });
            }

            let backoff = self.next();
            warn!(
                error=%e,
                task_name,
                attempts,
                backoff_secs = backoff.as_secs_f64(),
                "request encountered transient error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
