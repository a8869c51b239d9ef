//! In-memory directory of in-flight and recently finished operations.
//!
//! Entries are keyed by progress token. Each entry follows
//! `Pending -> Running -> {Completed | Failed | Aborted}`; the registry
//! itself applies updates last-write-wins and leaves transition discipline
//! to the handler wrapper that owns the token.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use maas_async_utils::AbortSignal;
use serde::Deserialize;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::clock::system_clock;
use crate::progress::DEFAULT_PROGRESS_TOTAL;
use crate::progress::RateLimitHistory;
use crate::types::ProgressToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Aborted => "aborted",
        }
    }
}

/// One tracked operation.
#[derive(Debug, Clone)]
pub struct Operation {
    pub token: ProgressToken,
    pub operation_type: String,
    pub status: OperationStatus,
    pub start_time: Instant,
    pub last_update_time: Instant,
    /// Wall-clock registration time, for display only.
    pub started_at: DateTime<Utc>,
    pub progress: f64,
    pub total: f64,
    pub message: String,
    /// Set when the operation failed.
    pub error: Option<String>,
    /// Request-scoped signal, used by [`OperationsRegistry::abort`].
    pub signal: Option<AbortSignal>,
}

/// Partial update merged into an existing entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationUpdate {
    pub status: Option<OperationStatus>,
    pub progress: Option<f64>,
    pub total: Option<f64>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl OperationUpdate {
    pub fn status(status: OperationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: f64, total: f64, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            total: Some(total),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Defaults to [`OperationStatus::Pending`].
    pub initial_status: Option<OperationStatus>,
    pub signal: Option<AbortSignal>,
}

/// Eviction thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Idle age after which a terminal entry is evicted.
    pub max_completed_age: Duration,
    /// Idle age after which any entry is evicted.
    pub max_stale_age: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_completed_age: Duration::from_secs(5 * 60),
            max_stale_age: Duration::from_secs(30 * 60),
        }
    }
}

/// Serialisable view of an entry for introspection tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub token: ProgressToken,
    pub operation_type: String,
    pub status: OperationStatus,
    pub progress: f64,
    pub total: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub idle_ms: u64,
}

#[derive(Debug)]
pub struct OperationsRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    operations: Mutex<HashMap<ProgressToken, Operation>>,
}

impl OperationsRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ProgressToken, Operation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an entry, replacing any previous entry for the same token.
    pub fn register(
        &self,
        token: ProgressToken,
        operation_type: impl Into<String>,
        options: RegisterOptions,
    ) -> Operation {
        let now = self.clock.now();
        let operation = Operation {
            token: token.clone(),
            operation_type: operation_type.into(),
            status: options.initial_status.unwrap_or(OperationStatus::Pending),
            start_time: now,
            last_update_time: now,
            started_at: Utc::now(),
            progress: 0.0,
            total: DEFAULT_PROGRESS_TOTAL,
            message: String::new(),
            error: None,
            signal: options.signal,
        };
        if self.entries().insert(token, operation.clone()).is_some() {
            tracing::debug!(progress_token = %operation.token, "Replaced existing operation entry");
        }
        operation
    }

    /// Merge `update` into the entry for `token`. Returns `false` when no
    /// such entry exists.
    pub fn update(&self, token: &ProgressToken, update: OperationUpdate) -> bool {
        self.update_where(token, update, |_| true)
    }

    /// Like [`OperationsRegistry::update`], skipped when the entry has
    /// already reached a terminal status.
    pub fn update_if_active(&self, token: &ProgressToken, update: OperationUpdate) -> bool {
        self.update_where(token, update, |operation| !operation.status.is_terminal())
    }

    fn update_where(
        &self,
        token: &ProgressToken,
        update: OperationUpdate,
        applies: impl FnOnce(&Operation) -> bool,
    ) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries();
        let Some(operation) = entries.get_mut(token) else {
            return false;
        };
        if !applies(operation) {
            return false;
        }
        if let Some(status) = update.status {
            if operation.status.is_terminal() && status != operation.status {
                tracing::debug!(
                    progress_token = %token,
                    from = operation.status.as_str(),
                    to = status.as_str(),
                    "Overwriting terminal operation status"
                );
            }
            operation.status = status;
        }
        if let Some(progress) = update.progress {
            operation.progress = progress;
        }
        if let Some(total) = update.total {
            operation.total = total;
        }
        if let Some(message) = update.message {
            operation.message = message;
        }
        if let Some(error) = update.error {
            operation.error = Some(error);
        }
        operation.last_update_time = now;
        true
    }

    pub fn get(&self, token: &ProgressToken) -> Option<Operation> {
        self.entries().get(token).cloned()
    }

    /// All entries, oldest first.
    pub fn all(&self) -> Vec<Operation> {
        let mut operations: Vec<Operation> = self.entries().values().cloned().collect();
        operations.sort_by_key(|operation| operation.start_time);
        operations
    }

    pub fn contains(&self, token: &ProgressToken) -> bool {
        self.entries().contains_key(token)
    }

    pub fn remove(&self, token: &ProgressToken) -> Option<Operation> {
        self.entries().remove(token)
    }

    /// Abort the signal stored with `token`. Returns `false` when the entry
    /// is unknown, has no signal, or its signal already fired.
    pub fn abort(&self, token: &ProgressToken, reason: &str) -> bool {
        let signal = self
            .entries()
            .get(token)
            .and_then(|operation| operation.signal.clone());
        signal.is_some_and(|signal| signal.abort(reason))
    }

    /// Evict idle terminal entries and any entry idle past the stale age.
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self) -> usize {
        let now = self.clock.now();
        let RegistryConfig {
            max_completed_age,
            max_stale_age,
        } = self.config;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|token, operation| {
            let idle = now.saturating_duration_since(operation.last_update_time);
            let evict = (operation.status.is_terminal() && idle > max_completed_age)
                || idle > max_stale_age;
            if evict {
                tracing::debug!(
                    progress_token = %token,
                    status = operation.status.as_str(),
                    idle_ms = idle.as_millis() as u64,
                    "Evicting stale operation"
                );
            }
            !evict
        });
        before - entries.len()
    }

    /// Drop every entry.
    pub fn reset(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn snapshot(&self, token: &ProgressToken) -> Option<OperationSnapshot> {
        let now = self.clock.now();
        self.entries()
            .get(token)
            .map(|operation| snapshot_of(operation, now))
    }

    /// Snapshots of all entries, oldest first.
    pub fn snapshots(&self) -> Vec<OperationSnapshot> {
        let now = self.clock.now();
        self.all()
            .iter()
            .map(|operation| snapshot_of(operation, now))
            .collect()
    }
}

impl Default for OperationsRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn snapshot_of(operation: &Operation, now: Instant) -> OperationSnapshot {
    OperationSnapshot {
        token: operation.token.clone(),
        operation_type: operation.operation_type.clone(),
        status: operation.status,
        progress: operation.progress,
        total: operation.total,
        message: operation.message.clone(),
        error: operation.error.clone(),
        started_at: operation.started_at,
        elapsed_ms: now.saturating_duration_since(operation.start_time).as_millis() as u64,
        idle_ms: now
            .saturating_duration_since(operation.last_update_time)
            .as_millis() as u64,
    }
}

/// Run [`OperationsRegistry::cleanup_stale`] every `interval` until
/// `shutdown` fires, dropping rate-limit records whose token is no longer
/// registered.
pub fn spawn_sweeper(
    registry: Arc<OperationsRegistry>,
    history: Arc<RateLimitHistory>,
    interval: Duration,
    shutdown: AbortSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let evicted = registry.cleanup_stale();
            let forgotten = history.retain(|token| registry.contains(token));
            if evicted > 0 || forgotten > 0 {
                tracing::info!(
                    evicted,
                    forgotten,
                    remaining = registry.len(),
                    "Swept stale operations"
                );
            }
        }
        tracing::debug!("Operation sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn registry() -> (Arc<ManualClock>, OperationsRegistry) {
        let clock = Arc::new(ManualClock::new());
        let registry = OperationsRegistry::with_clock(RegistryConfig::default(), clock.clone());
        (clock, registry)
    }

    fn token(value: &str) -> ProgressToken {
        ProgressToken::from(value)
    }

    #[test]
    fn register_then_get_returns_pending_entry() {
        let (_clock, registry) = registry();
        registry.register(token("tok-1"), "deploy-machine", RegisterOptions::default());

        let operation = registry.get(&token("tok-1")).unwrap();
        assert_eq!(operation.status, OperationStatus::Pending);
        assert_eq!(operation.progress, 0.0);
        assert_eq!(operation.operation_type, "deploy-machine");
        assert_eq!(operation.error, None);
    }

    #[test]
    fn register_honours_initial_status_and_overwrites() {
        let (_clock, registry) = registry();
        registry.register(token("tok-1"), "deploy-machine", RegisterOptions::default());
        registry.update(&token("tok-1"), OperationUpdate::progress(40.0, 100.0, "halfway"));

        registry.register(
            token("tok-1"),
            "commission-machine",
            RegisterOptions {
                initial_status: Some(OperationStatus::Running),
                signal: None,
            },
        );

        let operation = registry.get(&token("tok-1")).unwrap();
        assert_eq!(operation.status, OperationStatus::Running);
        assert_eq!(operation.operation_type, "commission-machine");
        assert_eq!(operation.progress, 0.0);
        assert_eq!(operation.message, "");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_merges_fields_and_bumps_timestamp() {
        let (clock, registry) = registry();
        let created = registry.register(token("tok-1"), "deploy-machine", RegisterOptions::default());
        clock.advance(Duration::from_secs(2));

        assert!(registry.update(
            &token("tok-1"),
            OperationUpdate::progress(150.0, 100.0, "overshoot").with_status(OperationStatus::Running),
        ));
        assert!(registry.update(&token("tok-1"), OperationUpdate::default().with_message("later")));

        let operation = registry.get(&token("tok-1")).unwrap();
        assert_eq!(operation.status, OperationStatus::Running);
        assert_eq!(operation.progress, 150.0);
        assert_eq!(operation.message, "later");
        assert_eq!(
            operation.last_update_time.duration_since(created.last_update_time),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn update_of_unknown_token_is_a_noop() {
        let (_clock, registry) = registry();
        assert!(!registry.update(&token("missing"), OperationUpdate::status(OperationStatus::Failed)));
        assert!(registry.is_empty());
    }

    #[test]
    fn terminal_status_can_still_be_overwritten() {
        let (_clock, registry) = registry();
        registry.register(token("tok-1"), "deploy-machine", RegisterOptions::default());
        registry.update(&token("tok-1"), OperationUpdate::status(OperationStatus::Completed));
        registry.update(&token("tok-1"), OperationUpdate::status(OperationStatus::Running));

        assert_eq!(
            registry.get(&token("tok-1")).unwrap().status,
            OperationStatus::Running
        );
    }

    #[test]
    fn update_if_active_leaves_terminal_entries_alone() {
        let (_clock, registry) = registry();
        registry.register(token("tok-1"), "deploy-machine", RegisterOptions::default());

        assert!(registry.update_if_active(
            &token("tok-1"),
            OperationUpdate::status(OperationStatus::Completed)
        ));
        assert!(!registry.update_if_active(
            &token("tok-1"),
            OperationUpdate::status(OperationStatus::Aborted)
        ));
        assert_eq!(
            registry.get(&token("tok-1")).unwrap().status,
            OperationStatus::Completed
        );
    }

    #[test]
    fn cleanup_evicts_old_terminal_and_stale_entries() {
        let (clock, registry) = registry();
        registry.register(token("done"), "deploy-machine", RegisterOptions::default());
        registry.update(&token("done"), OperationUpdate::status(OperationStatus::Completed));
        registry.register(token("stuck"), "deploy-machine", RegisterOptions::default());
        registry.update(&token("stuck"), OperationUpdate::status(OperationStatus::Running));

        clock.advance(Duration::from_secs(6 * 60));
        registry.register(token("fresh"), "deploy-machine", RegisterOptions::default());

        assert_eq!(registry.cleanup_stale(), 1);
        assert!(registry.get(&token("done")).is_none());
        assert!(registry.get(&token("stuck")).is_some());

        clock.advance(Duration::from_secs(25 * 60));
        assert_eq!(registry.cleanup_stale(), 1);
        assert!(registry.get(&token("stuck")).is_none());
        assert!(registry.get(&token("fresh")).is_some());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let (clock, registry) = registry();
        registry.register(token("a"), "deploy-machine", RegisterOptions::default());
        registry.update(&token("a"), OperationUpdate::status(OperationStatus::Failed));
        registry.register(token("b"), "deploy-machine", RegisterOptions::default());
        clock.advance(Duration::from_secs(10 * 60));

        assert_eq!(registry.cleanup_stale(), 1);
        let remaining: Vec<ProgressToken> = registry.all().into_iter().map(|op| op.token).collect();
        assert_eq!(registry.cleanup_stale(), 0);
        let again: Vec<ProgressToken> = registry.all().into_iter().map(|op| op.token).collect();
        assert_eq!(remaining, again);
    }

    #[test]
    fn abort_fires_stored_signal_once() {
        let (_clock, registry) = registry();
        let signal = AbortSignal::new();
        registry.register(
            token("tok-1"),
            "deploy-machine",
            RegisterOptions {
                initial_status: None,
                signal: Some(signal.clone()),
            },
        );
        registry.register(token("untracked"), "deploy-machine", RegisterOptions::default());

        assert!(registry.abort(&token("tok-1"), "cancelled by operator"));
        assert!(!registry.abort(&token("tok-1"), "again"));
        assert!(!registry.abort(&token("untracked"), "no signal"));
        assert!(!registry.abort(&token("missing"), "unknown"));
        assert_eq!(signal.reason().as_deref(), Some("cancelled by operator"));
    }

    #[test]
    fn snapshot_reports_ages_and_serialises_camel_case() {
        let (clock, registry) = registry();
        registry.register(token("tok-1"), "deploy-machine", RegisterOptions::default());
        clock.advance(Duration::from_millis(1500));
        registry.update(
            &token("tok-1"),
            OperationUpdate::status(OperationStatus::Failed).with_error("boom"),
        );
        clock.advance(Duration::from_millis(500));

        let snapshot = registry.snapshot(&token("tok-1")).unwrap();
        assert_eq!(snapshot.elapsed_ms, 2000);
        assert_eq!(snapshot.idle_ms, 500);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["operationType"], "deploy-machine");
        assert_eq!(value["error"], "boom");
        assert_eq!(registry.snapshots().len(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let (_clock, registry) = registry();
        registry.register(token("a"), "deploy-machine", RegisterOptions::default());
        registry.register(ProgressToken::Integer(1), "deploy-machine", RegisterOptions::default());
        registry.reset();
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_shutdown() {
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(OperationsRegistry::with_clock(
            RegistryConfig {
                max_completed_age: Duration::from_secs(1),
                max_stale_age: Duration::from_secs(60),
            },
            clock.clone(),
        ));
        registry.register(token("done"), "deploy-machine", RegisterOptions::default());
        registry.update(&token("done"), OperationUpdate::status(OperationStatus::Completed));
        clock.advance(Duration::from_secs(2));

        let history = Arc::new(RateLimitHistory::with_clock(clock.clone()));
        let config = crate::progress::RateLimitConfig::default();
        assert!(history.should_send(&token("done"), 0.0, 100.0, false, &config));
        assert!(history.should_send(&token("orphan"), 0.0, 100.0, false, &config));

        let shutdown = AbortSignal::new();
        let handle = spawn_sweeper(
            registry.clone(),
            history.clone(),
            Duration::from_secs(5),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(registry.is_empty());
        assert!(history.is_empty());

        shutdown.abort("shutting down");
        handle.await.unwrap();
    }
}
