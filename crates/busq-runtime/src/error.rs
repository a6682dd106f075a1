//! Error types for queue operations.

use crate::message::Timestamp;
use std::time::Duration;
use thiserror::Error;

/// Marker the service puts in the error description when an accept-session
/// call gave up because no session became available in time.
pub const SESSION_TIMEOUT_MARKER: &str = "com.microsoft:timeout";

/// Comprehensive error type for all gateway operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message lock lost: {message_id}")]
    MessageLockLost { message_id: String },

    #[error("No session available on queue '{queue_name}' (com.microsoft:timeout)")]
    NoSessionAvailable { queue_name: String },

    #[error("Session '{session_id}' is locked until {locked_until}")]
    SessionLocked {
        session_id: String,
        locked_until: Timestamp,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Permission denied for operation: {operation}")]
    PermissionDenied { operation: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("{operation} is not supported by the {provider} provider")]
    Unsupported { provider: String, operation: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if a completion failed because the message lock already expired.
    ///
    /// The message is not lost: it becomes available for redelivery to any
    /// receiver once the lock is gone.
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Self::MessageLockLost { .. })
    }

    /// Check if a session acquisition failed only because no session was
    /// available before the service-side timeout.
    ///
    /// Providers that surface the condition as an untyped error are matched on
    /// the [`SESSION_TIMEOUT_MARKER`] in the error text. A session held by
    /// another receiver ([`QueueError::SessionLocked`]) does not qualify.
    pub fn is_session_unavailable(&self) -> bool {
        match self {
            Self::NoSessionAvailable { .. } => true,
            Self::ProviderError { code, message, .. } => {
                code.contains(SESSION_TIMEOUT_MARKER) || message.contains(SESSION_TIMEOUT_MARKER)
            }
            _ => false,
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message header '{header}' has invalid value: {message}")]
    InvalidHeader { header: String, message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
