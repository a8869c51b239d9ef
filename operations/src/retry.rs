//! Retry executor with exponential backoff.
//!
//! Backend calls made by long-running operations go through [`retry`] (or
//! [`retry_with_signal`] when the caller holds an abort signal):
//! - Up to `max_attempts` calls; success returns immediately
//! - Delay doubles after every failed attempt (no jitter, no cap)
//! - Each retried failure is logged at `warn` with structured fields
//! - The final failure is wrapped with the attempt count

use std::fmt;
use std::future::Future;
use std::time::Duration;

use maas_async_utils::AbortError;
use maas_async_utils::AbortSignal;
use maas_async_utils::abortable;
use maas_async_utils::throw_if_aborted;

/// Default attempt budget for backend calls.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Retry error types
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last underlying error.
    #[error("operation failed after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The abort signal fired before an attempt or during backoff.
    #[error("retry aborted")]
    Aborted(#[from] AbortError),
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryError::Exhausted { attempts, .. } => Some(*attempts),
            RetryError::Aborted(_) => None,
        }
    }

    /// The last underlying error, when attempts ran out.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } => Some(source),
            RetryError::Aborted(_) => None,
        }
    }
}

/// Attempt budget and initial backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        retry(operation, self.max_attempts, self.initial_delay).await
    }
}

/// Call `operation` up to `max_attempts` times with exponential backoff.
///
/// A `max_attempts` of zero is treated as one.
pub async fn retry<F, Fut, T, E>(
    operation: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    run_with_backoff(operation, max_attempts, initial_delay, None, |_| true).await
}

/// Cancellable variant of [`retry`].
///
/// The signal is checked before every attempt, races each in-flight attempt,
/// and interrupts the backoff sleep. The backoff schedule itself is
/// independent of any timeout carried by the signal.
pub async fn retry_with_signal<F, Fut, T, E>(
    operation: F,
    policy: &RetryPolicy,
    signal: &AbortSignal,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    run_with_backoff(
        operation,
        policy.max_attempts,
        policy.initial_delay,
        Some(signal),
        |_| true,
    )
    .await
}

/// Like [`retry_with_signal`], giving up immediately on errors for which
/// `is_retryable` returns `false`.
pub async fn retry_when<F, Fut, T, E, P>(
    operation: F,
    policy: &RetryPolicy,
    signal: Option<&AbortSignal>,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    run_with_backoff(
        operation,
        policy.max_attempts,
        policy.initial_delay,
        signal,
        is_retryable,
    )
    .await
}

async fn run_with_backoff<F, Fut, T, E, P>(
    mut operation: F,
    max_attempts: u32,
    initial_delay: Duration,
    signal: Option<&AbortSignal>,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut delay = initial_delay;
    let mut attempt: u32 = 0;

    loop {
        throw_if_aborted(signal, None)?;
        attempt = attempt.saturating_add(1);

        let output = match signal {
            Some(signal) => abortable(operation(), signal).await?,
            None => operation().await,
        };

        match output {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts || !is_retryable(&err) => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying after backoff"
                );
                match signal {
                    Some(signal) => maas_async_utils::delay(delay, Some(signal)).await?,
                    None => tokio::time::sleep(delay).await,
                }
                delay = delay.saturating_mul(2);
            }
        }
    }
}
