use thiserror::Error;

/// Main error type for the HyperSearch controllers
#[derive(Error, Debug)]
pub enum HsError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Algorithm service error: {0}")]
    Algorithm(#[from] AlgorithmError),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {seconds}s waiting for {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl HsError {
    /// Whether a reconcile pass that failed with this error should be
    /// retried. Terminal failures are surfaced as conditions instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            HsError::Algorithm(AlgorithmError::Validation { .. }) => false,
            HsError::Validation(_) | HsError::Config(_) | HsError::Manifest(_) => false,
            _ => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HsError::Store(StoreError::NotFound { .. }))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, HsError::Store(StoreError::Conflict { .. }))
    }
}

/// Resource store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("{kind} {key} was modified concurrently: expected version {expected}, found {actual}")]
    Conflict {
        kind: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid {kind} {key}: {message}")]
    Invalid {
        kind: String,
        key: String,
        message: String,
    },
}

/// Errors surfaced by calls to the external algorithm service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmError {
    #[error("transport error talking to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("algorithm service at {endpoint} unavailable: {message}")]
    Unavailable { endpoint: String, message: String },

    #[error("{method} rejected the experiment: {message}")]
    Validation { method: String, message: String },

    #[error("algorithm service returned {actual} assignments, expected {expected}")]
    Protocol { expected: usize, actual: usize },

    #[error("{method} failed with {code}: {message}")]
    Remote {
        method: String,
        code: String,
        message: String,
    },

    #[error("{method} timed out after {timeout_seconds}s")]
    Timeout { method: String, timeout_seconds: u64 },
}

/// Result type alias for HyperSearch operations
pub type HsResult<T> = Result<T, HsError>;

/// Helper trait for converting string errors
pub trait IntoHsError {
    fn into_hs_error(self) -> HsError;
}

impl IntoHsError for String {
    fn into_hs_error(self) -> HsError {
        HsError::Internal(self)
    }
}

impl IntoHsError for &str {
    fn into_hs_error(self) -> HsError {
        HsError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HsError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HsError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HsError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AlgorithmError::Protocol {
            expected: 3,
            actual: 2,
        };

        assert!(error.to_string().contains("returned 2"));
        assert!(error.to_string().contains("expected 3"));
    }

    #[test]
    fn test_error_conversion() {
        let store_error = StoreError::NotFound {
            kind: "Trial".to_string(),
            key: "default/t-1".to_string(),
        };
        let hs_error: HsError = store_error.into();

        assert!(hs_error.is_not_found());
        assert!(!hs_error.is_conflict());
    }

    #[test]
    fn test_retry_classification() {
        let validation: HsError = AlgorithmError::Validation {
            method: "ValidateAlgorithmSettings".to_string(),
            message: "bad".to_string(),
        }
        .into();
        assert!(!validation.is_retryable());

        let unavailable: HsError = AlgorithmError::Unavailable {
            endpoint: "svc:6789".to_string(),
            message: "connection refused".to_string(),
        }
        .into();
        assert!(unavailable.is_retryable());

        let protocol: HsError = AlgorithmError::Protocol {
            expected: 3,
            actual: 1,
        }
        .into();
        assert!(protocol.is_retryable());
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing algorithm: {}", "random");
        assert!(config_err.to_string().contains("random"));
    }
}
