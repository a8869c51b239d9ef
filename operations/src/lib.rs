//! Long-running operation orchestration for the MAAS MCP bridge.
//!
//! A client request that kicks off slow backend work (deploy, commission,
//! image upload) flows through this crate:
//!
//! - [`registry`] tracks each operation's lifecycle by progress token.
//! - [`progress`] emits rate-limited `notifications/progress` messages.
//! - [`retry`] absorbs transient backend failures with exponential backoff.
//! - [`handler`] composes the above around a plain async business handler
//!   and maps failures to uniform tool results.
//!
//! Cancellation is carried by [`maas_async_utils::AbortSignal`].

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod clock;
pub mod error;
pub mod handler;
pub mod progress;
pub mod registry;
pub mod result;
pub mod retry;
pub mod types;

pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use error::OperationError;
pub use handler::ErrorHandler;
pub use handler::OperationContext;
pub use handler::OperationHandler;
pub use handler::OperationRequest;
pub use handler::OperationScope;
pub use handler::OperationServices;
pub use handler::create_operation_context;
pub use handler::handle_operation_error;
pub use handler::with_operation_handler;
pub use progress::NotificationOrigin;
pub use progress::NotificationSender;
pub use progress::ProgressNotification;
pub use progress::ProgressReporter;
pub use progress::ProgressUpdate;
pub use progress::RateLimitConfig;
pub use progress::RateLimitHistory;
pub use progress::send_progress_notification;
pub use registry::Operation;
pub use registry::OperationSnapshot;
pub use registry::OperationStatus;
pub use registry::OperationUpdate;
pub use registry::OperationsRegistry;
pub use registry::RegisterOptions;
pub use registry::RegistryConfig;
pub use registry::spawn_sweeper;
pub use result::ContentBlock;
pub use result::ToolResult;
pub use retry::RetryError;
pub use retry::RetryPolicy;
pub use retry::retry;
pub use retry::retry_when;
pub use retry::retry_with_signal;
pub use types::ProgressToken;
