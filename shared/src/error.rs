//! Error types for the research session backend.

use thiserror::Error;

use crate::models::ResearchStatus;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the research session lifecycle.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input from the caller
    #[error("Validation error on {field}: {message}")]
    Validation { field: String, message: String },

    /// Missing resource, or one owned by another user
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the resource's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Illegal status change. Reaching this is a programming defect.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ResearchStatus,
        to: ResearchStatus,
    },

    /// The external research workflow failed permanently
    #[error("Execution error: {0}")]
    Execution(String),

    /// Network, throttling or broker hiccup that may succeed on retry
    #[error("Transient infrastructure error: {0}")]
    TransientInfra(String),

    /// A bounded call ran past its deadline
    #[error("Timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// AWS SDK error
    #[error("AWS error: {0}")]
    Aws(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a field-level validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation { .. } => 400,
            Error::Auth(_) => 401,
            Error::NotFound(_) => 404,
            Error::InvalidState(_) => 409,
            _ => 500,
        }
    }

    /// Whether retrying the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientInfra(_) | Error::Timeout { .. } => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Message that is safe to show to the session owner.
    ///
    /// Client errors carry their own text. Everything else is replaced with a
    /// fixed sentence so exception text and agent output never reach users.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { message, .. } => message.clone(),
            Error::NotFound(what) => format!("{} not found", what),
            Error::InvalidState(message) => message.clone(),
            Error::Auth(_) => "Authentication required".to_string(),
            Error::Timeout { seconds } => {
                format!("Research timed out after {} seconds", seconds)
            }
            Error::Execution(_) => "The research workflow failed to produce a result".to_string(),
            Error::TransientInfra(_) => {
                "The research service was temporarily unavailable".to_string()
            }
            _ => "An internal error occurred".to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        match fields.first() {
            Some((field, errs)) => {
                let message = errs
                    .first()
                    .and_then(|e| e.message.as_ref())
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "is invalid".to_string());
                Error::validation(field.to_string(), message)
            }
            None => Error::validation("request", "is invalid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::validation("query", "required").status_code(), 400);
        assert_eq!(Error::NotFound("Research session".into()).status_code(), 404);
        assert_eq!(Error::InvalidState("not completed".into()).status_code(), 409);
        assert_eq!(Error::Execution("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_user_message_hides_internal_text() {
        let err = Error::Execution("Traceback: KeyError 'secret_prompt'".into());
        assert!(!err.user_message().contains("secret_prompt"));

        let err = Error::Internal("connection string postgres://u:p@h".into());
        assert_eq!(err.user_message(), "An internal error occurred");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout { seconds: 5 }.is_transient());
        assert!(Error::TransientInfra("throttled".into()).is_transient());
        assert!(!Error::Execution("bad output".into()).is_transient());
        assert!(!Error::validation("query", "empty").is_transient());
    }
}
