//! Retry with backoff
//!
//! One primitive for every "try again later" loop in the pipeline. By
//! default broker connections are retried forever every 5s and the model
//! is polled every 2s; both are a `RetryPolicy` with a fixed backoff and
//! no attempt limit. Exponential backoff and attempt caps are
//! available for callers that want them.

use super::shutdown::Shutdown;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Delay curve between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),

    /// `initial * multiplier^(attempt-1)`, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let millis = initial.as_millis() as f64 * multiplier.max(1.0).powi(exponent);
                let capped = millis.min(max.as_millis() as f64);
                Duration::from_millis(capped as u64)
            }
        }
    }
}

/// Why a retried operation stopped without succeeding
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// None retries forever
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Retry forever with a fixed delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Retry forever with exponential backoff.
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Exponential {
                initial,
                multiplier,
                max,
            },
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Run `operation` until it succeeds, attempts run out, or shutdown fires.
    ///
    /// `label` names the operation in retry log lines.
    pub async fn execute<F, Fut, T, E>(
        &self,
        shutdown: &Shutdown,
        label: &str,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_while(shutdown, label, |_| true, operation).await
    }

    /// Like [`execute`](Self::execute), but stops at the first error for
    /// which `retryable` is false and returns it as `Exhausted`.
    pub async fn execute_while<F, Fut, T, E, R>(
        &self,
        shutdown: &Shutdown,
        label: &str,
        retryable: R,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;

        loop {
            if shutdown.is_triggered() {
                return Err(RetryError::Cancelled);
            }

            attempt += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !retryable(&error) || self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                operation = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Err(RetryError::Cancelled),
            }
        }
    }
}
