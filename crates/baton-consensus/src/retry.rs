//! Retry policies with exponential backoff.
//!
//! Every retried operation reports each failure as either
//! [`Attempt::Transient`] (try again after a backoff) or
//! [`Attempt::Permanent`] (give up now). A [`RetryPolicy`] decides how many
//! transient failures are tolerated, and every wait is cut short by the
//! caller's cancellation token.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// At most `n` retries after the first attempt
    Bounded(u32),
    /// Retry until success, a permanent failure or cancellation
    Unbounded,
}

/// Exponential backoff schedule with jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random
    pub randomization: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
            multiplier: 1.5,
            randomization: 0.5,
        }
    }
}

impl Backoff {
    /// Fixed delay, no growth and no jitter
    pub fn constant(delay: Duration) -> Self {
        Backoff {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            randomization: 0.0,
        }
    }

    /// Delay before retry number `retry` (zero based)
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max.as_secs_f64());
        if self.randomization <= 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let spread = capped * self.randomization;
        let jittered = rand::thread_rng().gen_range((capped - spread)..=(capped + spread));
        Duration::from_secs_f64(jittered.clamp(0.0, self.max.as_secs_f64()))
    }
}

/// Outcome of one failed attempt
#[derive(Debug)]
pub enum Attempt<E> {
    Transient(E),
    Permanent(E),
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("permanent failure: {0}")]
    Permanent(E),

    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("retry cancelled")]
    Cancelled,
}

/// Run `operation` until it succeeds, fails permanently, exhausts `policy`
/// or `cancel` fires.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    backoff: &Backoff,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let mut failures: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = operation() => outcome,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(Attempt::Permanent(e)) => return Err(RetryError::Permanent(e)),
            Err(Attempt::Transient(e)) => e,
        };

        failures += 1;
        if let RetryPolicy::Bounded(max_retries) = policy {
            if failures > max_retries {
                error!("Operation failed after {} attempts: {}", failures, err);
                return Err(RetryError::Exhausted {
                    attempts: failures,
                    last: err,
                });
            }
        }

        let delay = backoff.delay(failures - 1);
        warn!("Operation failed, will retry in {:?}: {}", delay, err);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
