//! Error types for tripwire.
//!
//! All errors are strongly typed using thiserror, so callers can match on
//! specific conditions (a full queue, a shutdown in progress, a bad pattern)
//! instead of parsing messages.

use thiserror::Error;

use crate::checker::EvaluationError;
use crate::senders::SenderError;
use crate::storage::StorageError;

/// Validation errors raised while checking input or configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration {
        value: String,
        reason: String,
    },

    #[error("Invalid trigger '{name}': {reason}")]
    InvalidTrigger {
        name: String,
        reason: String,
    },

    #[error("Unknown sender type '{kind}' for sender '{name}'")]
    UnknownSenderType {
        name: String,
        kind: String,
    },

    #[error("Duplicate sender name '{name}'")]
    DuplicateSender {
        name: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors raised while the pipeline is running.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Queue '{path}' is full (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Channel '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Component '{component}' is shutting down")]
    ShuttingDown {
        component: String,
    },

    #[error("Failed to spawn thread '{name}': {message}")]
    Spawn {
        name: String,
        message: String,
    },

    #[error("I/O error: {message}")]
    Io {
        message: String,
    },
}

/// Top-level error type for tripwire.
#[derive(Debug, Error)]
pub enum TripwireError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sender error: {0}")]
    Sender(#[from] SenderError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl TripwireError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the operation may succeed when repeated later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }
            ),
            Self::Storage(e) => e.is_connection(),
            Self::Sender(e) => !matches!(e, SenderError::Config { .. }),
            Self::Evaluation(_) => false,
        }
    }
}

impl From<std::io::Error> for TripwireError {
    fn from(e: std::io::Error) -> Self {
        Self::Execution(ExecutionError::Io {
            message: e.to_string(),
        })
    }
}

/// Result type alias for tripwire operations.
pub type TripwireResult<T> = Result<T, TripwireError>;

/// Builds an `ExecutionError::Spawn` from a failed `thread::Builder::spawn`.
pub(crate) fn spawn_error(name: &str, err: &std::io::Error) -> TripwireError {
    TripwireError::Execution(ExecutionError::Spawn {
        name: name.to_string(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_pattern() {
        let err = ValidationError::InvalidPattern {
            pattern: "a.{b".to_string(),
            reason: "unclosed '{'".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("a.{b"));
        assert!(msg.contains("unclosed"));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        assert!(format!("{err}").contains("5000ms"));
    }

    #[test]
    fn test_tripwire_error_from_validation() {
        let err: TripwireError = ValidationError::MissingField {
            field: "name".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_tripwire_error_retryable() {
        let err: TripwireError = ExecutionError::Timeout { duration_ms: 10 }.into();
        assert!(err.is_execution());
        assert!(err.is_retryable());

        let err: TripwireError = StorageError::ConnectionError("refused".to_string()).into();
        assert!(err.is_retryable());

        let err: TripwireError = ExecutionError::ShuttingDown {
            component: "notifier".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_tripwire_error_internal() {
        let err = TripwireError::internal("unexpected state");
        assert!(matches!(err, TripwireError::Internal { .. }));
        assert!(format!("{err}").contains("unexpected state"));
    }
}
