//! Error types for scheduling and delivery operations.
//!
//! Delivery failures (`NetworkError`, `Timeout`, `HttpStatus`,
//! `InvalidRequest`) never escape the executor; they drive backoff and are
//! logged. Validation errors (`InvalidCron`, `Validation`) are returned to
//! whoever tried to create the offending record. Coordination errors
//! (`LockError`, `ChannelError`) make the election loop demote and restart.

use std::fmt;

use outbox_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Target answered with a non-2xx status.
    #[error("unexpected response: HTTP {status_code}")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body, if it was JSON or plain text
        body: Option<String>,
    },

    /// The request could not be built from the queue and message settings.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with the request
        message: String,
    },

    /// Cron expression failed to parse or never fires again.
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron {
        /// The offending expression
        expression: String,
        /// Parser message
        message: String,
    },

    /// Input rejected before anything was persisted.
    #[error("validation failed: {message}")]
    Validation {
        /// Validation message
        message: String,
    },

    /// Referenced entity does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Which entity was missing
        message: String,
    },

    /// Database operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Advisory lock acquisition or release failed.
    #[error("lock error: {message}")]
    LockError {
        /// Lock error message
        message: String,
    },

    /// Wake channel publish or subscribe failed.
    #[error("wake channel error: {message}")]
    ChannelError {
        /// Channel error message
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an error from a non-2xx response.
    pub fn http_status(status_code: u16, body: Option<String>) -> Self {
        Self::HttpStatus { status_code, body }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates an invalid cron error.
    pub fn invalid_cron(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCron { expression: expression.into(), message: message.into() }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates a lock error.
    pub fn lock(message: impl Into<String>) -> Self {
        Self::LockError { message: message.into() }
    }

    /// Creates a wake channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::ChannelError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether the error was caused by the caller's input.
    ///
    /// These are the only errors surfaced to API clients as 4xx.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidCron { .. } | Self::Validation { .. } | Self::NotFound { .. })
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => Self::NotFound { message },
            CoreError::ConstraintViolation(message) => Self::Validation { message },
            CoreError::Database(message) => Self::DatabaseError { message },
        }
    }
}

/// Category of delivery error for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// Non-2xx responses.
    Http,
    /// Caller input problems.
    Validation,
    /// Database operations.
    Database,
    /// Lock and wake channel problems.
    Coordination,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::HttpStatus { .. } => Self::Http,
            DeliveryError::InvalidRequest { .. }
            | DeliveryError::InvalidCron { .. }
            | DeliveryError::Validation { .. }
            | DeliveryError::NotFound { .. } => Self::Validation,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::LockError { .. } | DeliveryError::ChannelError { .. } => {
                Self::Coordination
            },
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Http => write!(f, "http"),
            Self::Validation => write!(f, "validation"),
            Self::Database => write!(f, "database"),
            Self::Coordination => write!(f, "coordination"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_cron_message_names_expression() {
        let err = DeliveryError::invalid_cron("hello world", "bad field");
        assert_eq!(err.to_string(), "Invalid cron expression 'hello world': bad field");
        assert!(err.is_client_error());
    }

    #[test]
    fn core_errors_convert_by_kind() {
        let not_found = DeliveryError::from(CoreError::NotFound("queue".into()));
        assert!(matches!(not_found, DeliveryError::NotFound { .. }));

        let constraint = DeliveryError::from(CoreError::ConstraintViolation("fk".into()));
        assert!(matches!(constraint, DeliveryError::Validation { .. }));

        let database = DeliveryError::from(CoreError::Database("gone".into()));
        assert!(matches!(database, DeliveryError::DatabaseError { .. }));
        assert!(!database.is_client_error());
    }

    #[test]
    fn categories_group_related_errors() {
        assert_eq!(ErrorCategory::from(&DeliveryError::timeout(30)), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::http_status(503, None)),
            ErrorCategory::Http
        );
        assert_eq!(ErrorCategory::from(&DeliveryError::lock("lost")), ErrorCategory::Coordination);
        assert_eq!(ErrorCategory::Coordination.to_string(), "coordination");
    }
}
