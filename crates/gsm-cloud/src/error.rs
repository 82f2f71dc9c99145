//! Cloud provider error types

use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Rate limiting, throttling, dropped connections. Safe to retry.
    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("API error ({code}): {message}")]
    Api { code: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Fault raised by the in-memory provider
    #[error("Injected fault in {0}")]
    Injected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the provider reports the resource as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProviderError::Transient("throttled".into()).is_transient());
        assert!(!ProviderError::Timeout("instance".into()).is_transient());
        assert!(ProviderError::not_found("instance", "i-1").is_not_found());
        assert!(!ProviderError::api("DependencyViolation", "in use").is_not_found());
    }
}
