use maas_async_utils::AbortError;
use maas_async_utils::find_abort_error;
use maas_async_utils::handle_abort_error;
use maas_async_utils::is_abort_error;

/// Error returned by a wrapped operation handler.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("Operation {operation} was aborted: {}", .source.reason())]
    Aborted {
        operation: String,
        #[source]
        source: AbortError,
    },

    #[error("Operation {operation} failed: {source:#}")]
    Failed {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

impl OperationError {
    /// Classify a handler failure. Abort-like errors become
    /// [`OperationError::Aborted`], everything else [`OperationError::Failed`].
    pub fn classify(operation: impl Into<String>, err: anyhow::Error) -> Self {
        let operation = operation.into();
        if !is_abort_error(&err) {
            return OperationError::Failed {
                operation,
                source: err,
            };
        }
        let err = handle_abort_error(err, None);
        let source = match find_abort_error(&err) {
            Some(abort) => abort.clone(),
            None => AbortError::new(err.to_string()),
        };
        OperationError::Aborted { operation, source }
    }

    pub fn aborted(operation: impl Into<String>, source: AbortError) -> Self {
        OperationError::Aborted {
            operation: operation.into(),
            source,
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            OperationError::Aborted { operation, .. } | OperationError::Failed { operation, .. } => {
                operation
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, OperationError::Aborted { .. })
    }

    /// Message recorded on the registry entry.
    pub fn status_message(&self) -> String {
        match self {
            OperationError::Aborted { source, .. } => source.reason().to_string(),
            OperationError::Failed { source, .. } => format!("{source:#}"),
        }
    }
}
