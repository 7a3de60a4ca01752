//! Error taxonomy shared by every layer between an inbound tool call and the
//! outbound booking API.
//!
//! [`ToolError`] is the single error type that flows through the middleware
//! pipeline, the retry executor and the tool handlers. Each variant maps onto
//! one [`ErrorKind`], which is what callers see on the wire, and onto one
//! [`Disposition`], which is what the retry executor acts on.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while serving a tool call.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The outbound call never produced an HTTP response (connect, reset, DNS).
    #[error("network error: {0}")]
    Network(String),

    /// The booking API answered with a non-success status.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Parameters failed local validation before any outbound call was made.
    #[error("invalid params: {0}")]
    Validation(String),

    /// The caller exhausted its request budget for the current window.
    #[error("rate limit exceeded for client {client_id}; retry after {}s", .retry_after.as_secs())]
    RateLimitExceeded {
        client_id: String,
        retry_after: Duration,
    },

    /// The cached authentication check failed or the verifier rejected us.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Every retry was spent on transient failures.
    #[error("gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<ToolError>,
    },

    /// The caller-supplied deadline passed before an attempt could start.
    #[error("deadline exceeded after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// No tool is registered under the requested name.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used by handlers and middleware.
pub type Result<T> = std::result::Result<T, ToolError>;

/// Caller-visible classification of a [`ToolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientError,
    PermanentError,
    RateLimitExceeded,
    AuthenticationFailure,
    RetryExhausted,
}

impl ErrorKind {
    /// Returns the stable identifier used in protocol error bodies and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientError => "TransientError",
            Self::PermanentError => "PermanentError",
            Self::RateLimitExceeded => "RateLimitExceeded",
            Self::AuthenticationFailure => "AuthenticationFailure",
            Self::RetryExhausted => "RetryExhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the retry executor should do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Permanent,
}

impl ToolError {
    /// Convenience constructor for upstream status failures.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Maps this error onto the caller-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::TransientError,
            Self::Upstream { status, .. } if is_transient_status(*status) => {
                ErrorKind::TransientError
            }
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::Authentication(_) => ErrorKind::AuthenticationFailure,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Upstream { .. }
            | Self::Validation(_)
            | Self::Timeout { .. }
            | Self::MethodNotFound(_)
            | Self::Internal(_) => ErrorKind::PermanentError,
        }
    }

    /// Number of attempts made, when the error came out of the retry executor.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } | Self::Timeout { attempts } => Some(*attempts),
            _ => None,
        }
    }
}

/// 429 and every 5xx are worth another attempt.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Default failure classifier.
///
/// Network failures, upstream 429 and upstream 5xx are [`Disposition::Retryable`];
/// every other error, including the remaining 4xx statuses and local validation
/// failures, is [`Disposition::Permanent`].
pub fn classify(error: &ToolError) -> Disposition {
    match error.kind() {
        ErrorKind::TransientError => Disposition::Retryable,
        _ => Disposition::Permanent,
    }
}
