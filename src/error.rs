//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Every variant is raised while building limiters or loading configuration.
/// Admission decisions themselves never fail.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter parameter was zero, negative or not finite
    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: String,
    },

    /// A limiter with a background task was built outside a Tokio runtime
    #[error("Leaky bucket limiters require a running Tokio runtime")]
    NoRuntime,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        TurnstileError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
