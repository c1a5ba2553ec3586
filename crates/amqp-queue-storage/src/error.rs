//! Error types for queue storage operations.

use thiserror::Error;

/// Comprehensive error type for all queue storage operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{component} should be initialized before calling this method")]
    NotInitialized { component: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Failed to send {failed} of {total} messages: {message}")]
    SendFailed {
        failed: usize,
        total: usize,
        message: String,
    },

    #[error("Error while deserializing message {message_id}: {reason}")]
    MalformedMessage { message_id: String, reason: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Link '{link}' is closed")]
    LinkClosed { link: String },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Settlement of message {message_id} failed: {message}")]
    SettlementFailed { message_id: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient, so repeating the operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotInitialized { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            // Re-sending may duplicate items the broker already accepted
            Self::SendFailed { .. } => false,
            Self::MalformedMessage { .. } => false,
            Self::Cancelled => false,
            Self::LinkClosed { .. } => true,
            Self::SessionClosed => true,
            Self::SettlementFailed { .. } => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    pub(crate) fn not_initialized(component: &str) -> Self {
        Self::NotInitialized {
            component: component.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{key} is not defined")]
    Missing { key: String },

    #[error("Minimum value for {key} is {minimum}")]
    BelowMinimum { key: String, minimum: u64 },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl ConfigurationError {
    pub(crate) fn missing(key: &str) -> Self {
        Self::Missing {
            key: key.to_string(),
        }
    }

    pub(crate) fn below_minimum(key: &str, minimum: u64) -> Self {
        Self::BelowMinimum {
            key: key.to_string(),
            minimum,
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Parsing {
            message: err.to_string(),
        }
    }
}

/// Validation errors for caller-supplied arguments
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
