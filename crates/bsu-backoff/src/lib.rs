//! Backoff/poll engine (design spec §4.1).
//!
//! Turns "submit a request, then poll until the cloud converges" into a
//! single call. Runs a caller-supplied attempt up to `steps` times, sleeping
//! `initial`, `initial * factor`, `initial * factor^2`, ... between
//! attempts. Every sleep is cancellable: a cancelled scope returns promptly
//! instead of completing the outstanding attempt (design spec §5).

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub use bsu_common::config::{parse_duration_flexible, BackoffConfig};

/// Outcome of a single attempt passed to [`BackoffPolicy::run`].
pub enum Step<T, E> {
    /// The predicate converged; stop polling and return `T`.
    Done(T),
    /// Not converged yet; sleep and try again.
    Retry,
    /// A terminal failure; stop polling and propagate `E`.
    Fail(E),
}

/// Error produced when [`BackoffPolicy::run`] does not return [`Step::Done`].
#[derive(Debug)]
pub enum BackoffError<E> {
    /// The cancellable scope was cancelled while a sleep (or the initial
    /// attempt) was outstanding.
    Cancelled,
    /// The step budget was exhausted before the predicate converged.
    Exhausted,
    /// The attempt reported a terminal failure.
    Attempt(E),
}

impl<E: fmt::Display> fmt::Display for BackoffError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Exhausted => write!(f, "backoff steps exhausted without converging"),
            Self::Attempt(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BackoffError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Attempt(e) => Some(e),
            _ => None,
        }
    }
}

/// Exponential backoff/poll schedule (design spec §4.1).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffConfig::default().into()
    }
}

impl From<BackoffConfig> for BackoffPolicy {
    fn from(cfg: BackoffConfig) -> Self {
        Self {
            initial: cfg.initial,
            factor: cfg.factor,
            steps: cfg.steps,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(initial: Duration, factor: f64, steps: u32) -> Self {
        Self {
            initial,
            factor,
            steps,
        }
    }

    /// Run `attempt` up to `self.steps` times, sleeping the exponential
    /// schedule between attempts, honoring `cancel`.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Step<T, E>>,
    {
        let mut delay = self.initial;

        for step in 0..self.steps {
            if cancel.is_cancelled() {
                return Err(BackoffError::Cancelled);
            }

            trace!(step, "backoff attempt");
            match attempt().await {
                Step::Done(value) => return Ok(value),
                Step::Fail(err) => return Err(BackoffError::Attempt(err)),
                Step::Retry => {}
            }

            if step + 1 == self.steps {
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(BackoffError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }

            delay = Duration::from_secs_f64((delay.as_secs_f64() * self.factor).max(delay.as_secs_f64()));
        }

        debug!(steps = self.steps, "backoff exhausted");
        Err(BackoffError::Exhausted)
    }
}
