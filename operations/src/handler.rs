//! Operation handler wrapper.
//!
//! [`with_operation_handler`] turns a plain async business handler into a
//! tracked, cancellable operation. When the request carries a progress token
//! the wrapper registers the operation, hands the handler an
//! [`OperationScope`] bound to a request-scoped signal and progress reporter,
//! and records the terminal status. Requests without a token run the handler
//! directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use maas_async_utils::AbortError;
use maas_async_utils::AbortRegistration;
use maas_async_utils::AbortSignal;
use maas_async_utils::DeriveOptions;
use maas_async_utils::abortable;
use maas_async_utils::is_abort_error;
use maas_async_utils::on_abort;
use maas_async_utils::throw_if_aborted;
use tracing::Instrument;

use crate::error::OperationError;
use crate::progress::NotificationOrigin;
use crate::progress::NotificationSender;
use crate::progress::ProgressReporter;
use crate::progress::ProgressUpdate;
use crate::progress::RateLimitConfig;
use crate::progress::RateLimitHistory;
use crate::registry::OperationStatus;
use crate::registry::OperationUpdate;
use crate::registry::OperationsRegistry;
use crate::registry::RegisterOptions;
use crate::registry::RegistryConfig;
use crate::result::ToolResult;
use crate::retry::RetryError;
use crate::retry::RetryPolicy;
use crate::retry::retry_when;
use crate::retry::retry_with_signal;
use crate::types::ProgressToken;

/// Shared stores and policies used by every wrapped handler.
#[derive(Debug, Clone)]
pub struct OperationServices {
    pub registry: Arc<OperationsRegistry>,
    pub rate_limit_history: Arc<RateLimitHistory>,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    /// Upper bound on a tracked operation's run time.
    pub request_timeout: Option<Duration>,
}

impl OperationServices {
    pub fn new(registry: Arc<OperationsRegistry>, rate_limit_history: Arc<RateLimitHistory>) -> Self {
        Self {
            registry,
            rate_limit_history,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            request_timeout: None,
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for OperationServices {
    fn default() -> Self {
        Self::new(
            Arc::new(OperationsRegistry::new(RegistryConfig::default())),
            Arc::new(RateLimitHistory::new()),
        )
    }
}

/// Inbound call to a wrapped handler.
pub struct OperationRequest<P> {
    pub params: P,
    /// Absent for fire-and-forget requests; disables tracking.
    pub progress_token: Option<ProgressToken>,
    pub request_id: Option<String>,
    pub signal: AbortSignal,
    pub sender: Option<Arc<dyn NotificationSender>>,
}

impl<P> OperationRequest<P> {
    pub fn new(params: P, signal: AbortSignal) -> Self {
        Self {
            params,
            progress_token: None,
            request_id: None,
            signal,
            sender: None,
        }
    }

    pub fn with_progress_token(mut self, token: Option<ProgressToken>) -> Self {
        self.progress_token = token;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn NotificationSender>) -> Self {
        self.sender = Some(sender);
        self
    }
}

/// Tracking state for one operation with a progress token.
///
/// Dropping the context unregisters its abort cleanup.
pub struct OperationContext {
    pub progress_token: ProgressToken,
    pub operation_name: String,
    /// Request-scoped signal derived from the caller's.
    pub signal: AbortSignal,
    pub span: tracing::Span,
    progress: Option<ProgressReporter>,
    registry: Arc<OperationsRegistry>,
    cleanup: AbortRegistration,
}

impl OperationContext {
    pub async fn send_progress(&self, progress: f64, message: impl Into<String>) {
        self.send_progress_update(ProgressUpdate::new(progress, message))
            .await;
    }

    /// Record the update on the registry entry, then notify the client.
    pub async fn send_progress_update(&self, update: ProgressUpdate) {
        self.registry.update_if_active(
            &self.progress_token,
            OperationUpdate::progress(update.progress, update.total, update.message.clone()),
        );
        if let Some(reporter) = &self.progress {
            reporter.send_update(update).await;
        }
    }

    pub fn unregister_cleanup(&self) {
        self.cleanup.unregister();
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        self.cleanup.unregister();
    }
}

/// Build the tracking context for a request, or `None` when the request
/// carries no progress token.
pub fn create_operation_context(
    services: &OperationServices,
    progress_token: Option<&ProgressToken>,
    operation_name: &str,
    sender: Option<Arc<dyn NotificationSender>>,
    signal: &AbortSignal,
    request_id: Option<&str>,
) -> Option<OperationContext> {
    let token = progress_token?.clone();
    let signal = AbortSignal::derived(
        Some(signal),
        DeriveOptions {
            timeout: services.request_timeout,
            reason: None,
        },
    );
    services.registry.register(
        token.clone(),
        operation_name,
        RegisterOptions {
            initial_status: None,
            signal: Some(signal.clone()),
        },
    );

    let span = tracing::info_span!(
        "operation",
        operation = operation_name,
        progress_token = %token,
        request_id = request_id,
    );

    let progress = sender.map(|sender| {
        ProgressReporter::new(
            token.clone(),
            sender,
            Arc::clone(&services.rate_limit_history),
        )
        .with_origin(NotificationOrigin {
            request_id: request_id.map(str::to_string),
            tool_name: Some(operation_name.to_string()),
        })
        .with_config(services.rate_limit)
        .with_signal(signal.clone())
    });

    let cleanup = {
        let registry = Arc::clone(&services.registry);
        let token = token.clone();
        let fired = signal.clone();
        let span = span.clone();
        on_abort(&signal, move || {
            let reason = fired.reason().unwrap_or_default();
            if registry.update_if_active(
                &token,
                OperationUpdate::status(OperationStatus::Aborted).with_message(reason.clone()),
            ) {
                span.in_scope(|| tracing::info!(reason = %reason, "Operation aborted"));
            }
        })
    };

    Some(OperationContext {
        progress_token: token,
        operation_name: operation_name.to_string(),
        signal,
        span,
        progress,
        registry: Arc::clone(&services.registry),
        cleanup,
    })
}

/// What a business handler sees of its operation.
#[derive(Clone)]
pub struct OperationScope {
    context: Option<Arc<OperationContext>>,
    signal: AbortSignal,
    retry: RetryPolicy,
}

impl OperationScope {
    fn tracked(context: Arc<OperationContext>, retry: RetryPolicy) -> Self {
        Self {
            signal: context.signal.clone(),
            context: Some(context),
            retry,
        }
    }

    fn untracked(signal: AbortSignal, retry: RetryPolicy) -> Self {
        Self {
            context: None,
            signal,
            retry,
        }
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn context(&self) -> Option<&OperationContext> {
        self.context.as_deref()
    }

    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.context().map(|context| &context.progress_token)
    }

    /// Report progress out of 100. A no-op for untracked requests.
    pub async fn send_progress(&self, progress: f64, message: impl Into<String>) {
        if let Some(context) = self.context() {
            context.send_progress(progress, message).await;
        }
    }

    pub async fn send_progress_update(&self, update: ProgressUpdate) {
        if let Some(context) = self.context() {
            context.send_progress_update(update).await;
        }
    }

    pub fn throw_if_aborted(&self) -> Result<(), AbortError> {
        throw_if_aborted(Some(&self.signal), None)
    }

    pub async fn delay(&self, duration: Duration) -> Result<(), AbortError> {
        maas_async_utils::delay(duration, Some(&self.signal)).await
    }

    /// Run a backend call through the retry executor under this scope's
    /// signal.
    pub async fn retry<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        retry_with_signal(operation, &self.retry, &self.signal).await
    }

    /// Like [`OperationScope::retry`], giving up at once on errors that
    /// `is_retryable` rejects.
    pub async fn retry_when<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        retry_when(operation, &self.retry, Some(&self.signal), is_retryable).await
    }
}

/// Handler wrapped by [`with_operation_handler`].
pub struct OperationHandler<H> {
    name: String,
    services: OperationServices,
    handler: H,
}

pub fn with_operation_handler<H>(
    services: OperationServices,
    operation_name: impl Into<String>,
    handler: H,
) -> OperationHandler<H> {
    OperationHandler {
        name: operation_name.into(),
        services,
        handler,
    }
}

impl<H> OperationHandler<H> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &OperationServices {
        &self.services
    }

    /// Run the handler for one request.
    ///
    /// Handler success is returned unmodified. Failures are classified into
    /// [`OperationError::Aborted`] or [`OperationError::Failed`] and recorded
    /// on the registry entry when the request is tracked.
    pub async fn call<P, T, Fut>(&self, request: OperationRequest<P>) -> Result<T, OperationError>
    where
        H: Fn(P, OperationScope) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let OperationRequest {
            params,
            progress_token,
            request_id,
            signal,
            sender,
        } = request;

        let Some(context) = create_operation_context(
            &self.services,
            progress_token.as_ref(),
            &self.name,
            sender,
            &signal,
            request_id.as_deref(),
        ) else {
            let scope = OperationScope::untracked(signal, self.services.retry);
            return (self.handler)(params, scope)
                .await
                .map_err(|err| OperationError::classify(&self.name, err));
        };

        let context = Arc::new(context);
        let span = context.span.clone();
        self.run_tracked(context, params).instrument(span).await
    }

    async fn run_tracked<P, T, Fut>(
        &self,
        context: Arc<OperationContext>,
        params: P,
    ) -> Result<T, OperationError>
    where
        H: Fn(P, OperationScope) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let registry = &self.services.registry;
        let token = &context.progress_token;

        registry.update(token, OperationUpdate::status(OperationStatus::Running));
        tracing::info!("Operation started");

        let scope = OperationScope::tracked(Arc::clone(&context), self.services.retry);
        let outcome = match abortable((self.handler)(params, scope), &context.signal).await {
            Ok(result) => result.map_err(|err| OperationError::classify(&self.name, err)),
            Err(abort) => Err(OperationError::aborted(&self.name, abort)),
        };
        context.unregister_cleanup();

        match &outcome {
            Ok(_) => {
                let (total, message) = registry
                    .get(token)
                    .map(|operation| (operation.total, operation.message))
                    .unwrap_or_default();
                let message = if message.is_empty() {
                    format!("Operation {} completed", self.name)
                } else {
                    message
                };
                registry.update(
                    token,
                    OperationUpdate::progress(total, total, message)
                        .with_status(OperationStatus::Completed),
                );
                tracing::info!("Operation completed");
            }
            Err(err) if err.is_aborted() => {
                let reason = err.status_message();
                registry.update(
                    token,
                    OperationUpdate::status(OperationStatus::Aborted).with_message(reason.clone()),
                );
                tracing::info!(reason = %reason, "Operation aborted");
            }
            Err(err) => {
                let message = err.status_message();
                registry.update(
                    token,
                    OperationUpdate::status(OperationStatus::Failed)
                        .with_message(message.clone())
                        .with_error(message.clone()),
                );
                tracing::warn!(error = %message, "Operation failed");
            }
        }
        self.services.rate_limit_history.forget(token);
        outcome
    }
}

/// Custom error mapping tried by [`handle_operation_error`].
pub type ErrorHandler = dyn Fn(&anyhow::Error) -> Option<ToolResult> + Send + Sync;

/// Map a failed operation to the error result returned to the client.
///
/// Aborts always yield `"Operation {name} was aborted"`. Otherwise the
/// custom handlers run in order and the first match wins; the fallback is
/// `"Operation {name} failed: {message}"`. Every branch sets `is_error`.
pub fn handle_operation_error(
    error: impl Into<anyhow::Error>,
    operation_name: &str,
    custom_handlers: &[&ErrorHandler],
) -> ToolResult {
    let error = error.into();
    let aborted = ToolResult::error(format!("Operation {operation_name} was aborted"));
    let inner = match error.downcast_ref::<OperationError>() {
        Some(OperationError::Aborted { .. }) => return aborted,
        Some(OperationError::Failed { source, .. }) => source,
        None => &error,
    };
    if is_abort_error(inner) {
        return aborted;
    }
    for handler in custom_handlers {
        if let Some(mut result) = handler(inner) {
            result.is_error = true;
            return result;
        }
    }
    ToolResult::error(format!("Operation {operation_name} failed: {inner:#}"))
}
