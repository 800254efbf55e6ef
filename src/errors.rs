//! Error types and handling for the rug metadata cache
//!
//! Covers every layer of the system:
//! - Identifier building and parsing
//! - Persistent store access and pipelined batches
//! - Business operation orchestration
//! - Cache serialization

use thiserror::Error;
use std::fmt;

/// Main error type for the rug cache
#[derive(Error, Debug)]
pub enum RugCacheError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("ownership mismatch: token {token} is owned by {actual}, not {claimed}")]
    OwnershipMismatch {
        token: String,
        claimed: String,
        actual: String,
    },

    #[error("partial pipeline failure in {operation_id}: {failed} of {total} commands failed")]
    TransactionPartialFailure {
        operation_id: String,
        failed: usize,
        total: usize,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Identifier and input validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("empty {component} in {id_kind} id")]
    EmptyComponent { id_kind: String, component: String },

    #[error("malformed {id_kind} id: {value} ({reason})")]
    MalformedId {
        id_kind: String,
        value: String,
        reason: String,
    },

    #[error("invalid trait type {value}: {reason}")]
    InvalidTraitType { value: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Entity lookup failures
#[derive(Error, Debug)]
pub enum NotFoundError {
    #[error("token {0}")]
    Token(String),

    #[error("contract {0}")]
    Contract(String),

    #[error("trait {0}")]
    Trait(String),

    #[error("user {0}")]
    User(String),
}

/// Persistent store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("store timeout: operation={operation}, timeout_ms={timeout_ms}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("command failed: {command} ({reason})")]
    CommandFailed { command: String, reason: String },

    #[error("wrong value type at key {key}")]
    WrongType { key: String },
}

/// Serialization errors for stored blobs
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON encode failed for {context}: {reason}")]
    Encode { context: String, reason: String },

    #[error("JSON decode failed for {context}: {reason}")]
    Decode { context: String, reason: String },

    #[error("malformed field {field} in stored record {key}")]
    MalformedField { key: String, field: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("invalid configuration value: key={key}, value={value}, reason={reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("configuration parsing failed: {reason}")]
    ParsingFailed { reason: String },
}

/// Result type aliases for convenience
pub type Result<T> = std::result::Result<T, RugCacheError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

impl RugCacheError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            RugCacheError::Store(StoreError::Unavailable { .. }) => true,
            RugCacheError::Store(StoreError::Timeout { .. }) => true,
            RugCacheError::TransactionPartialFailure { .. } => true,
            RugCacheError::Validation(_) => false,
            RugCacheError::Configuration(_) => false,
            RugCacheError::OwnershipMismatch { .. } => false,
            _ => false,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RugCacheError::TransactionPartialFailure { .. } => ErrorSeverity::High,
            RugCacheError::Store(_) => ErrorSeverity::High,
            RugCacheError::Serialization(_) => ErrorSeverity::Medium,
            RugCacheError::Configuration(_) => ErrorSeverity::High,
            RugCacheError::OwnershipMismatch { .. } => ErrorSeverity::Medium,
            RugCacheError::NotFound(_) => ErrorSeverity::Low,
            RugCacheError::Validation(_) => ErrorSeverity::Low,
        }
    }
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::Decode {
            context: "json".to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_recoverable() {
        let err = RugCacheError::Store(StoreError::Unavailable {
            reason: "connection refused".to_string(),
        });
        assert!(err.is_recoverable());
        assert_eq!(err.severity(), ErrorSeverity::High);
    }

    #[test]
    fn ownership_mismatch_is_terminal() {
        let err = RugCacheError::OwnershipMismatch {
            token: "8453:0xabc:42".to_string(),
            claimed: "0xa".to_string(),
            actual: "0xc".to_string(),
        };
        assert!(!err.is_recoverable());
    }
}
