pub mod invoke;
pub mod log_source;
pub mod object_store;

use thiserror::Error;

/// Failure reported by an external collaborator.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{operation} failed: {message}")]
    RequestFailed {
        operation: &'static str,
        message: String,
    },
    #[error("invalid response from {operation}: {message}")]
    InvalidResponse {
        operation: &'static str,
        message: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn request_failed(operation: &'static str, error: impl std::fmt::Display) -> Self {
        Self::RequestFailed {
            operation,
            message: error.to_string(),
        }
    }

    pub fn invalid_response(operation: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            operation,
            message: message.into(),
        }
    }

    /// Stable error class used in failed item outcomes.
    pub fn class(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::RequestFailed { .. } => "request_failed",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_stable() {
        assert_eq!(AdapterError::NotFound("x".to_string()).class(), "not_found");
        assert_eq!(
            AdapterError::request_failed("PutObject", "throttled").class(),
            "request_failed"
        );
        assert_eq!(
            AdapterError::from(std::io::Error::other("disk full")).class(),
            "io_error"
        );
    }

    #[test]
    fn display_names_the_operation() {
        let error = AdapterError::request_failed("DescribeDBLogFiles", "access denied");
        assert_eq!(error.to_string(), "DescribeDBLogFiles failed: access denied");
    }
}
