//! Rate-limited progress notifications.
//!
//! A chatty operation may report progress many times per second; the client
//! only needs the first update, the last one, and periodic updates in
//! between. [`RateLimitHistory`] remembers when a notification was last sent
//! for each progress token and [`send_progress_notification`] consults it
//! before handing the message to the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use maas_async_utils::AbortSignal;
use maas_async_utils::abortable;
use serde::Deserialize;
use serde::Serialize;

use crate::clock::Clock;
use crate::clock::system_clock;
use crate::types::ProgressToken;

/// JSON-RPC method used for progress notifications.
pub const PROGRESS_NOTIFICATION_METHOD: &str = "notifications/progress";

/// Total assumed when the caller does not supply one.
pub const DEFAULT_PROGRESS_TOTAL: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotificationParams {
    pub progress_token: ProgressToken,
    pub progress: f64,
    pub total: f64,
    pub message: String,
}

/// `notifications/progress` message as delivered to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressNotification {
    pub method: String,
    pub params: ProgressNotificationParams,
}

impl ProgressNotification {
    pub fn new(params: ProgressNotificationParams) -> Self {
        Self {
            method: PROGRESS_NOTIFICATION_METHOD.to_string(),
            params,
        }
    }
}

/// Transport seam for outbound notifications.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_notification(&self, notification: ProgressNotification) -> anyhow::Result<()>;
}

/// Notification rate-limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Minimum spacing between notifications for one token.
    pub min_interval: Duration,
    /// Always deliver `progress == 0`.
    pub always_send_first: bool,
    /// Always deliver `progress == total`.
    pub always_send_last: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            always_send_first: true,
            always_send_last: true,
        }
    }
}

/// Per-token record of the last delivered notification.
#[derive(Debug)]
pub struct RateLimitHistory {
    clock: Arc<dyn Clock>,
    last_sent: Mutex<HashMap<ProgressToken, Instant>>,
}

impl RateLimitHistory {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ProgressToken, Instant>> {
        self.last_sent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a notification should go out now, recording the send
    /// when it should.
    pub fn should_send(
        &self,
        token: &ProgressToken,
        progress: f64,
        total: f64,
        important: bool,
        config: &RateLimitConfig,
    ) -> bool {
        let now = self.clock.now();
        let bypass = important
            || (config.always_send_first && progress == 0.0)
            || (config.always_send_last && progress == total);

        let mut records = self.records();
        let due = records
            .get(token)
            .is_none_or(|last| now.saturating_duration_since(*last) >= config.min_interval);
        if bypass || due {
            records.insert(token.clone(), now);
            true
        } else {
            false
        }
    }

    pub fn last_sent(&self, token: &ProgressToken) -> Option<Instant> {
        self.records().get(token).copied()
    }

    /// Drop the record for one token.
    pub fn forget(&self, token: &ProgressToken) {
        self.records().remove(token);
    }

    /// Keep only the records whose token satisfies `keep`. Returns the
    /// number dropped.
    pub fn retain(&self, mut keep: impl FnMut(&ProgressToken) -> bool) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|token, _| keep(token));
        before - records.len()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records().clear();
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

impl Default for RateLimitHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// One progress report.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub total: f64,
    pub message: String,
    /// Bypass rate limiting for this update.
    pub important: bool,
    pub signal: Option<AbortSignal>,
}

impl ProgressUpdate {
    pub fn new(progress: f64, message: impl Into<String>) -> Self {
        Self {
            progress,
            total: DEFAULT_PROGRESS_TOTAL,
            message: message.into(),
            important: false,
            signal: None,
        }
    }

    pub fn total(mut self, total: f64) -> Self {
        self.total = total;
        self
    }

    pub fn important(mut self) -> Self {
        self.important = true;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Where a notification comes from, for log correlation.
#[derive(Debug, Clone, Default)]
pub struct NotificationOrigin {
    pub request_id: Option<String>,
    pub tool_name: Option<String>,
}

/// Send a progress notification unless it is rate limited.
///
/// Does nothing without a token or sender, or when the update's signal has
/// fired. Delivery failures are logged and swallowed.
pub async fn send_progress_notification(
    progress_token: Option<&ProgressToken>,
    update: ProgressUpdate,
    sender: Option<&dyn NotificationSender>,
    origin: &NotificationOrigin,
    config: &RateLimitConfig,
    history: &RateLimitHistory,
) {
    let (Some(token), Some(sender)) = (progress_token, sender) else {
        return;
    };
    if update.signal.as_ref().is_some_and(AbortSignal::is_aborted) {
        tracing::debug!(progress_token = %token, "Skipping progress notification for aborted operation");
        return;
    }
    if !history.should_send(token, update.progress, update.total, update.important, config) {
        tracing::debug!(
            progress_token = %token,
            progress = update.progress,
            total = update.total,
            "Progress notification rate limited"
        );
        return;
    }

    let ProgressUpdate {
        progress,
        total,
        message,
        signal,
        ..
    } = update;
    let notification = ProgressNotification::new(ProgressNotificationParams {
        progress_token: token.clone(),
        progress,
        total,
        message,
    });

    let outcome = match signal {
        Some(signal) => match abortable(sender.send_notification(notification), &signal).await {
            Ok(outcome) => outcome,
            Err(abort) => {
                tracing::debug!(progress_token = %token, reason = abort.reason(), "Progress notification abandoned");
                return;
            }
        },
        None => sender.send_notification(notification).await,
    };

    if let Err(err) = outcome {
        tracing::warn!(
            progress_token = %token,
            progress,
            total,
            request_id = origin.request_id.as_deref(),
            tool = origin.tool_name.as_deref(),
            error = %err,
            "Failed to send progress notification"
        );
    }
}

/// Progress sender bound to one token, transport, and rate-limit policy.
#[derive(Clone)]
pub struct ProgressReporter {
    token: ProgressToken,
    sender: Arc<dyn NotificationSender>,
    origin: NotificationOrigin,
    config: RateLimitConfig,
    history: Arc<RateLimitHistory>,
    signal: Option<AbortSignal>,
}

impl ProgressReporter {
    pub fn new(
        token: ProgressToken,
        sender: Arc<dyn NotificationSender>,
        history: Arc<RateLimitHistory>,
    ) -> Self {
        Self {
            token,
            sender,
            origin: NotificationOrigin::default(),
            config: RateLimitConfig::default(),
            history,
            signal: None,
        }
    }

    pub fn with_origin(mut self, origin: NotificationOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn token(&self) -> &ProgressToken {
        &self.token
    }

    /// Report `progress` out of 100.
    pub async fn send(&self, progress: f64, message: impl Into<String>) {
        self.send_update(ProgressUpdate::new(progress, message)).await;
    }

    /// Report a fully specified update. The update's own signal, when set,
    /// overrides the one bound to the reporter.
    pub async fn send_update(&self, mut update: ProgressUpdate) {
        if update.signal.is_none() {
            update.signal = self.signal.clone();
        }
        send_progress_notification(
            Some(&self.token),
            update,
            Some(&*self.sender),
            &self.origin,
            &self.config,
            &self.history,
        )
        .await;
    }
}
