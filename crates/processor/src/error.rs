//! Processor-level error types.

use thiserror::Error;

use store::EventSource;

/// Failure returned by a source handler.
///
/// The variant decides retry behaviour: `Transport` and `Overloaded` are
/// retried on the backoff schedule, the rest are terminal.  `Internal`
/// falls back to message classification (transport-style markers retry).
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("downstream overloaded: {0}")]
    Overloaded(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Internal(String),
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Overloaded(_) => true,
            Self::Validation(_) | Self::Permission(_) | Self::Configuration(_) => false,
            Self::Internal(message) => crate::retry::is_transport_style(message),
        }
    }
}

/// Errors from the processor itself.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error("no handler registered for source '{0}'")]
    NoHandler(EventSource),

    #[error("event '{0}' is terminal and cannot be retried")]
    Terminal(String),
}
