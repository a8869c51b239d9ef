//! Abort error type and classification helpers.

use crate::signal::AbortSignal;

/// Substrings that mark an error message as a cancellation, matched
/// case-insensitively against every error in the chain.
const ABORT_MARKERS: [&str; 3] = ["aborted", "canceled", "cancelled"];

/// Error returned when work is preempted by an [`AbortSignal`].
///
/// Carries the reason recorded on the signal at abort time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation aborted: {reason}")]
pub struct AbortError {
    reason: String,
}

impl AbortError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Build the error for a signal that has fired.
    ///
    /// Falls back to the default reason when the signal was cancelled
    /// through its raw token and never recorded one.
    pub fn from_signal(signal: &AbortSignal) -> Self {
        Self::new(signal.reason_or_default())
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Return the first [`AbortError`] in the error chain, if any.
pub fn find_abort_error(err: &anyhow::Error) -> Option<&AbortError> {
    err.chain().find_map(|cause| cause.downcast_ref::<AbortError>())
}

/// Whether `err` represents a cancellation.
///
/// True for a typed [`AbortError`] anywhere in the chain, or for any error
/// whose message mentions an abort or cancellation.
pub fn is_abort_error(err: &anyhow::Error) -> bool {
    if find_abort_error(err).is_some() {
        return true;
    }
    err.chain().any(|cause| {
        let message = cause.to_string().to_ascii_lowercase();
        ABORT_MARKERS.iter().any(|marker| message.contains(marker))
    })
}

/// Normalise cancellation errors to [`AbortError`].
///
/// Abort-like errors are converted, using `message` as the reason when
/// given; every other error is returned unchanged.
pub fn handle_abort_error(err: anyhow::Error, message: Option<&str>) -> anyhow::Error {
    if !is_abort_error(&err) {
        return err;
    }
    match (find_abort_error(&err), message) {
        (Some(_), None) => err,
        (Some(abort), Some(message)) if abort.reason() == message => err,
        (_, Some(message)) => AbortError::new(message).into(),
        (None, None) => AbortError::new(err.to_string()).into(),
    }
}
