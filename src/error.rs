//! Error types for the vault funnel.

use crate::funnel::state::{FunnelState, Intent};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Funnel error: {0}")]
    Funnel(#[from] FunnelError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures of a single remote operation.
///
/// `Unavailable` means the service could not be reached at all;
/// `Rejected` means it answered, but not with a usable result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Service rejected {operation} (status {status}): {reason}")]
    Rejected {
        operation: String,
        status: u16,
        reason: String,
    },
}

impl ServiceError {
    pub fn unavailable(operation: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    pub fn rejected(operation: &str, status: u16, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.to_string(),
            status,
            reason: reason.into(),
        }
    }

    /// Whether this is a connectivity failure rather than an error response.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Step-specific funnel failures surfaced to the presentation layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FunnelError {
    #[error("Failed to extract salary data: {0}")]
    Extraction(ServiceError),

    #[error("Analysis failed: {0}")]
    Analysis(ServiceError),

    #[error("Assistant did not respond: {0}")]
    Conversation(ServiceError),

    #[error("Lead capture failed: {0}")]
    LeadCapture(ServiceError),

    #[error("{intent} is not allowed while {state}")]
    PreconditionViolation { intent: Intent, state: FunnelState },
}

/// Rejections of a document before it is submitted.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Unsupported document type: {0} (expected PNG, JPEG or PDF)")]
    UnsupportedType(String),

    #[error("Document is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("Document is empty")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
