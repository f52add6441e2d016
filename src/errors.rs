//! Error handling for the tallying pipeline

/// Result type alias for the tallying pipeline
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tallying pipeline
///
/// Duplicate deliveries are not represented here: under at-least-once
/// delivery they are an expected outcome, reported through
/// [`crate::aggregation::Rejection::Duplicate`] and
/// [`crate::types::CommitResult::AlreadyProcessed`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The queue service could not be reached; retried with backoff, never escalated
    #[error("Queue unavailable: {message}")]
    QueueUnavailable { message: String },

    /// The storage service could not complete a transaction; retryable by the caller
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// The envelope is missing fields or cannot be decoded
    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// The storage layer refused the write; fatal for this envelope only
    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The pipeline is shutting down
    #[error("Shutdown in progress")]
    Shutdown,

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new queue unavailability error
    pub fn queue_unavailable(message: impl Into<String>) -> Self {
        Self::QueueUnavailable {
            message: message.into(),
        }
    }

    /// Create a new storage unavailability error
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
        }
    }

    /// Create a new invalid envelope error
    pub fn invalid_envelope(reason: impl Into<String>) -> Self {
        Self::InvalidEnvelope {
            reason: reason.into(),
        }
    }

    /// Create a new constraint violation error
    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueueUnavailable { .. } | Self::StorageUnavailable { .. }
        )
    }
}

/// Convenience macros for creating specific error types
#[macro_export]
macro_rules! storage_error {
    ($msg:expr) => {
        $crate::Error::storage_unavailable($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::storage_unavailable(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! queue_error {
    ($msg:expr) => {
        $crate::Error::queue_unavailable($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::queue_unavailable(format!($fmt, $($arg)*))
    };
}
