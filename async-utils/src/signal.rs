//! One-shot cancellation latch with a recorded reason.
//!
//! An [`AbortSignal`] starts live and transitions exactly once to aborted.
//! The reason recorded by the first `abort` call is immutable afterwards.
//! Derived and combined signals follow their inputs downward only: aborting
//! a derived signal never aborts its parent.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::future::select_all;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tokio_util::sync::WaitForCancellationFuture;

/// Reason reported when a signal fires without an explicit one.
pub const DEFAULT_ABORT_REASON: &str = "operation aborted";

/// Reason recorded when a derived signal's timeout elapses.
pub const DEFAULT_TIMEOUT_REASON: &str = "operation timed out";

/// Shared cancellation latch.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    reason: OnceLock<String>,
    /// Fires when the last handle is dropped so watcher tasks can exit.
    detached: CancellationToken,
    _detach_guard: DropGuard,
}

/// Options for [`AbortSignal::derived`].
#[derive(Debug, Clone, Default)]
pub struct DeriveOptions {
    pub timeout: Option<Duration>,
    pub reason: Option<String>,
}

impl DeriveOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            reason: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let detached = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                reason: OnceLock::new(),
                _detach_guard: detached.clone().drop_guard(),
                detached,
            }),
        }
    }

    /// A signal that nothing is wired to abort.
    pub fn never() -> Self {
        Self::new()
    }

    /// A signal that is already aborted with `reason`.
    pub fn aborted(reason: impl Into<String>) -> Self {
        let signal = Self::new();
        signal.abort(reason);
        signal
    }

    /// Abort the signal. Returns false when it had already fired, in which
    /// case the original reason is kept.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        if self.inner.token.is_cancelled() {
            return false;
        }
        if self.inner.reason.set(reason.into()).is_err() {
            return false;
        }
        self.inner.token.cancel();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The recorded reason, or `None` while the signal is live.
    pub fn reason(&self) -> Option<String> {
        self.is_aborted().then(|| self.reason_or_default())
    }

    pub(crate) fn reason_or_default(&self) -> String {
        self.inner
            .reason
            .get()
            .cloned()
            .unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string())
    }

    /// Resolves once the signal has aborted.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Owned variant of [`AbortSignal::cancelled`] for spawned tasks.
    pub fn cancelled_owned(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.token.clone().cancelled_owned()
    }

    /// The underlying token, for APIs that speak `CancellationToken`.
    ///
    /// Cancelling the token directly aborts the signal with
    /// [`DEFAULT_ABORT_REASON`].
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Whether both handles refer to the same signal.
    pub fn ptr_eq(&self, other: &AbortSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Derive a signal that aborts with `parent`, or when `options.timeout`
    /// elapses.
    ///
    /// An already-aborted parent yields an already-aborted signal with the
    /// parent's reason and no timer. Otherwise a watcher task is spawned on
    /// the current Tokio runtime; it exits (dropping any pending timer) as
    /// soon as either source fires, the derived signal is aborted directly,
    /// or every handle to the derived signal is dropped.
    pub fn derived(parent: Option<&AbortSignal>, options: DeriveOptions) -> Self {
        let child = Self::new();
        if let Some(parent) = parent
            && parent.is_aborted()
        {
            child.abort(parent.reason_or_default());
            return child;
        }
        if parent.is_none() && options.timeout.is_none() {
            return child;
        }

        let parent = parent.cloned();
        let deadline = options
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let timeout_reason = options
            .reason
            .unwrap_or_else(|| DEFAULT_TIMEOUT_REASON.to_string());
        child.watch(async move {
            tokio::select! {
                reason = wait_for_reason(parent.as_ref()) => reason,
                () = sleep_until(deadline) => timeout_reason,
            }
        });
        child
    }

    /// Shorthand for a derived signal with no timeout.
    pub fn child(&self) -> Self {
        Self::derived(Some(self), DeriveOptions::default())
    }

    /// Shorthand for a derived signal that also aborts after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self::derived(Some(self), DeriveOptions::with_timeout(timeout))
    }

    /// Spawn a task that aborts `self` with the reason produced by `source`,
    /// unless `self` fires first or is dropped.
    fn watch<F>(&self, source: F)
    where
        F: Future<Output = String> + Send + 'static,
    {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let own = self.inner.token.clone();
        let detached = self.inner.detached.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                biased;
                () = own.cancelled() => return,
                () = detached.cancelled() => return,
                reason = source => reason,
            };
            if let Some(inner) = weak.upgrade() {
                AbortSignal { inner }.abort(reason);
            }
        });
    }

    pub(crate) fn detached_token(&self) -> CancellationToken {
        self.inner.detached.clone()
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("reason", &self.reason())
            .finish()
    }
}

async fn wait_for_reason(signal: Option<&AbortSignal>) -> String {
    match signal {
        Some(signal) => {
            signal.cancelled().await;
            signal.reason_or_default()
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Combine several optional signals into one that aborts when any input does.
///
/// `None` entries are ignored. A single remaining signal is returned as is;
/// no remaining signals yields a signal that never aborts. The combined
/// signal carries the reason of the first input to abort, unless `reason`
/// overrides it.
pub fn combine_signals(signals: &[Option<&AbortSignal>], reason: Option<&str>) -> AbortSignal {
    let live: Vec<&AbortSignal> = signals.iter().flatten().copied().collect();
    match live.as_slice() {
        [] => return AbortSignal::never(),
        [only] => return (*only).clone(),
        _ => {}
    }

    let pick_reason = |input: &AbortSignal| {
        reason
            .map(str::to_string)
            .unwrap_or_else(|| input.reason_or_default())
    };
    if let Some(fired) = live.iter().find(|signal| signal.is_aborted()) {
        return AbortSignal::aborted(pick_reason(*fired));
    }

    let combined = AbortSignal::new();
    let override_reason = reason.map(str::to_string);
    let inputs: Vec<BoxFuture<'static, String>> = live
        .into_iter()
        .map(|signal| {
            let signal = signal.clone();
            Box::pin(async move {
                signal.cancelled().await;
                signal.reason_or_default()
            }) as BoxFuture<'static, String>
        })
        .collect();
    combined.watch(async move {
        let (first_reason, _index, _rest) = select_all(inputs).await;
        override_reason.unwrap_or(first_reason)
    });
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn derived_signal_times_out_with_supplied_reason() {
        let parent = AbortSignal::new();
        let derived = AbortSignal::derived(
            Some(&parent),
            DeriveOptions::with_timeout(Duration::from_millis(500)).reason("deploy took too long"),
        );

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(!derived.is_aborted());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(derived.is_aborted());
        assert_eq!(derived.reason().as_deref(), Some("deploy took too long"));
        assert!(!parent.is_aborted(), "abort must not flow upward");
    }

    #[tokio::test(start_paused = true)]
    async fn parent_abort_wins_over_later_timeout() {
        let parent = AbortSignal::new();
        let derived = parent.with_timeout(Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(50)).await;
        parent.abort("client disconnected");
        tokio::task::yield_now().await;
        derived.cancelled().await;
        assert_eq!(derived.reason().as_deref(), Some("client disconnected"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(derived.reason().as_deref(), Some("client disconnected"));
    }

    #[tokio::test]
    async fn already_aborted_parent_aborts_derived_immediately() {
        let parent = AbortSignal::aborted("shutdown");
        let derived = parent.with_timeout(Duration::from_secs(60));

        assert!(derived.is_aborted());
        assert_eq!(derived.reason().as_deref(), Some("shutdown"));
    }

    #[tokio::test]
    async fn reason_is_immutable_after_first_abort() {
        let signal = AbortSignal::new();
        assert!(signal.abort("first"));
        assert!(!signal.abort("second"));
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn raw_token_cancellation_uses_default_reason() {
        let signal = AbortSignal::new();
        signal.token().cancel();
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().as_deref(), Some(DEFAULT_ABORT_REASON));
    }

    #[tokio::test]
    async fn combine_returns_single_input_and_never_for_empty() {
        let only = AbortSignal::new();
        let combined = combine_signals(&[None, Some(&only), None], None);
        assert!(combined.ptr_eq(&only));

        let empty = combine_signals(&[None, None], None);
        assert!(!empty.is_aborted());
    }

    #[tokio::test]
    async fn combine_propagates_first_reason() {
        let a = AbortSignal::new();
        let b = AbortSignal::new();
        let combined = combine_signals(&[Some(&a), Some(&b)], None);

        b.abort("b fired");
        combined.cancelled().await;
        a.abort("a fired");

        assert_eq!(combined.reason().as_deref(), Some("b fired"));
        assert_eq!(a.reason().as_deref(), Some("a fired"));
    }

    #[tokio::test]
    async fn combine_applies_override_reason() {
        let a = AbortSignal::new();
        let b = AbortSignal::aborted("b fired");
        let combined = combine_signals(&[Some(&a), Some(&b)], Some("request cancelled"));

        assert_eq!(combined.reason().as_deref(), Some("request cancelled"));
        assert!(!a.is_aborted());
    }
}
