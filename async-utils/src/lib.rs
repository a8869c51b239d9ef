//! Cancellation utilities for long-running operations.
//!
//! Provides [`AbortSignal`], a one-shot cancellation latch that records a
//! reason, plus helpers to race futures against it, sleep cancellably, and
//! run cleanup when a signal fires. Built on tokio's `CancellationToken`.

mod error;
mod signal;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use error::AbortError;
pub use error::find_abort_error;
pub use error::handle_abort_error;
pub use error::is_abort_error;
pub use signal::AbortSignal;
pub use signal::DEFAULT_ABORT_REASON;
pub use signal::DEFAULT_TIMEOUT_REASON;
pub use signal::DeriveOptions;
pub use signal::combine_signals;

/// Extension trait for making futures abortable.
///
/// Allows any future to race against an [`AbortSignal`], returning
/// `Err(AbortError)` if the signal fires before the future completes.
#[async_trait]
pub trait OrAbortExt: Sized {
    type Output;

    /// Race this future against the signal.
    async fn or_abort(self, signal: &AbortSignal) -> Result<Self::Output, AbortError>;
}

#[async_trait]
impl<F> OrAbortExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_abort(self, signal: &AbortSignal) -> Result<Self::Output, AbortError> {
        abortable(self, signal).await
    }
}

/// Race `future` against `signal`.
///
/// An already-aborted signal fails immediately without polling `future`.
pub async fn abortable<F>(future: F, signal: &AbortSignal) -> Result<F::Output, AbortError>
where
    F: Future,
{
    abortable_with_cleanup(future, signal, || {}).await
}

/// Like [`abortable`], additionally running `cleanup` exactly once when the
/// signal wins the race. `cleanup` never runs when `future` completes first.
pub async fn abortable_with_cleanup<F, C>(
    future: F,
    signal: &AbortSignal,
    cleanup: C,
) -> Result<F::Output, AbortError>
where
    F: Future,
    C: FnOnce(),
{
    if signal.is_aborted() {
        cleanup();
        return Err(AbortError::from_signal(signal));
    }
    tokio::select! {
        biased;
        () = signal.cancelled() => {
            cleanup();
            Err(AbortError::from_signal(signal))
        }
        output = future => Ok(output),
    }
}

/// Sleep for `duration`, failing early if `signal` is or becomes aborted.
pub async fn delay(duration: Duration, signal: Option<&AbortSignal>) -> Result<(), AbortError> {
    match signal {
        Some(signal) => abortable(tokio::time::sleep(duration), signal).await,
        None => {
            tokio::time::sleep(duration).await;
            Ok(())
        }
    }
}

/// Fail with the signal's reason (or `message`) if it has aborted.
/// A missing signal never fails.
pub fn throw_if_aborted(signal: Option<&AbortSignal>, message: Option<&str>) -> Result<(), AbortError> {
    match signal {
        Some(signal) if signal.is_aborted() => Err(match message {
            Some(message) => AbortError::new(message),
            None => AbortError::from_signal(signal),
        }),
        _ => Ok(()),
    }
}

pub fn is_aborted(signal: Option<&AbortSignal>) -> bool {
    signal.is_some_and(AbortSignal::is_aborted)
}

/// Handle returned by [`on_abort`].
#[derive(Debug, Clone)]
pub struct AbortRegistration {
    token: CancellationToken,
}

impl AbortRegistration {
    /// Prevent the cleanup from running if the signal has not fired yet.
    pub fn unregister(&self) {
        self.token.cancel();
    }

    pub fn is_unregistered(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Run `cleanup` once, on a spawned task, when `signal` aborts.
///
/// An already-aborted signal schedules the cleanup for the next scheduling
/// opportunity rather than running it inline. Dropping the returned
/// registration does not unregister the cleanup.
pub fn on_abort<F>(signal: &AbortSignal, cleanup: F) -> AbortRegistration
where
    F: FnOnce() + Send + 'static,
{
    let registration = CancellationToken::new();
    let unregistered = registration.clone();
    let run = move || {
        if !unregistered.is_cancelled() {
            tracing::trace!("Running abort cleanup");
            cleanup();
        }
    };

    if signal.is_aborted() {
        tokio::spawn(async move { run() });
    } else {
        let unregistered = registration.clone();
        let fired = signal.cancelled_owned();
        let detached = signal.detached_token();
        // `fired` is polled before `detached` so a signal aborted and then
        // dropped before this task first runs still gets its cleanup.
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = unregistered.cancelled() => {}
                () = fired => run(),
                () = detached.cancelled() => {}
            }
        });
    }
    AbortRegistration {
        token: registration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use tokio::task;
    use tokio::time::sleep;

    #[tokio::test]
    async fn returns_ok_when_future_completes_first() {
        let signal = AbortSignal::new();
        let value = async { 42 };

        let result = value.or_abort(&signal).await;

        assert_eq!(Ok(42), result);
    }

    #[tokio::test]
    async fn returns_err_when_signal_aborted_first() {
        let signal = AbortSignal::new();
        let signal_clone = signal.clone();

        let abort_handle = task::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            signal_clone.abort("stop requested");
        });

        let result = async {
            sleep(Duration::from_millis(100)).await;
            7
        }
        .or_abort(&signal)
        .await;

        abort_handle.await.expect("abort task panicked");
        assert_eq!(Err(AbortError::new("stop requested")), result);
    }

    #[tokio::test]
    async fn returns_err_when_signal_already_aborted() {
        let signal = AbortSignal::aborted("gone");
        let polled = Arc::new(AtomicUsize::new(0));
        let polled_clone = Arc::clone(&polled);

        let result = abortable(
            async move {
                polled_clone.fetch_add(1, Ordering::SeqCst);
                5
            },
            &signal,
        )
        .await;

        assert_eq!(Err(AbortError::new("gone")), result);
        assert_eq!(polled.load(Ordering::SeqCst), 0, "work must not be polled");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_runs_once_when_signal_wins() {
        let signal = AbortSignal::new();
        let cleanups = AtomicUsize::new(0);
        let signal_clone = signal.clone();
        task::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            signal_clone.abort("cancelled by client");
        });

        let result = abortable_with_cleanup(
            sleep(Duration::from_secs(5)),
            &signal,
            || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert_eq!(Err(AbortError::new("cancelled by client")), result);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_never_runs_when_future_wins() {
        let signal = AbortSignal::new();
        let cleanups = AtomicUsize::new(0);

        let result = abortable_with_cleanup(async { "done" }, &signal, || {
            cleanups.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        signal.abort("late");

        assert_eq!(Ok("done"), result);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_completes_or_aborts() {
        assert_eq!(Ok(()), delay(Duration::from_millis(20), None).await);

        let signal = AbortSignal::new();
        assert_eq!(Ok(()), delay(Duration::from_millis(20), Some(&signal)).await);

        let signal_clone = signal.clone();
        task::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            signal_clone.abort("timeout");
        });
        let started = tokio::time::Instant::now();
        let result = delay(Duration::from_secs(30), Some(&signal)).await;
        assert_eq!(Err(AbortError::new("timeout")), result);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn throw_if_aborted_uses_reason_or_message() {
        assert_eq!(Ok(()), throw_if_aborted(None, None));

        let live = AbortSignal::new();
        assert_eq!(Ok(()), throw_if_aborted(Some(&live), Some("unused")));
        assert!(!is_aborted(Some(&live)));
        assert!(!is_aborted(None));

        let fired = AbortSignal::aborted("user pressed stop");
        assert_eq!(
            Err(AbortError::new("user pressed stop")),
            throw_if_aborted(Some(&fired), None)
        );
        assert_eq!(
            Err(AbortError::new("deploy cancelled")),
            throw_if_aborted(Some(&fired), Some("deploy cancelled"))
        );
        assert!(is_aborted(Some(&fired)));
    }

    #[tokio::test]
    async fn on_abort_runs_cleanup_after_abort() {
        let signal = AbortSignal::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _registration = on_abort(&signal, move || {
            let _ = tx.send(());
        });

        signal.abort("bye");
        rx.await.expect("cleanup should run");
    }

    #[tokio::test]
    async fn on_abort_with_fired_signal_is_deferred() {
        let signal = AbortSignal::aborted("already gone");
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        let _registration = on_abort(&signal, move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0, "must not run inline");

        for _ in 0..10 {
            task::yield_now().await;
            if ran.load(Ordering::SeqCst) == 1 {
                break;
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn on_abort_runs_cleanup_when_signal_dropped_after_abort() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let signal = AbortSignal::new();
            let ran_clone = Arc::clone(&ran);
            let _registration = on_abort(&signal, move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            });
            signal.abort("bye");
        }
        let ran_clone = Arc::clone(&ran);
        let _registration = on_abort(&AbortSignal::aborted("gone"), move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..20 {
            task::yield_now().await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregister_before_abort_prevents_cleanup() {
        let signal = AbortSignal::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        let registration = on_abort(&signal, move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        registration.unregister();
        signal.abort("after unregister");

        for _ in 0..10 {
            task::yield_now().await;
        }
        assert!(registration.is_unregistered());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
