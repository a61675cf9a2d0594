//! Error Taxonomy
//!
//! Every failure a step can produce is classified into one of six
//! categories. The category is assigned where the error is raised and
//! travels unchanged through both backends, so retry and abort decisions
//! never depend on the wording of a message.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::manifest::ManifestError;
use crate::remote::SandboxError;
use crate::rpc::RpcError;
use crate::store::StoreError;

/// Failure category shared by the step contract and both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Auth,
    Permission,
    Network,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    /// Only transient categories are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure raised at the step contract boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{category}: {message}")]
pub struct StepError {
    pub category: ErrorCategory,
    pub message: String,
    /// Upstream step whose table was missing, for input resolution failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

impl StepError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            upstream: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permission, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, message)
    }

    /// The table of `upstream` is absent from the store.
    pub fn missing_input(upstream: &str) -> Self {
        Self {
            category: ErrorCategory::Validation,
            message: format!("missing input: upstream step '{}' produced no table", upstream),
            upstream: Some(upstream.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    /// Returns a copy with the message passed through `f`.
    pub fn map_message(mut self, f: impl FnOnce(&str) -> String) -> Self {
        self.message = f(&self.message);
        self
    }
}

/// Top-level error for operations that happen outside a single step.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Table store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Step '{step_id}' uses unknown implementation '{implementation}'")]
    UnknownImplementation { step_id: String, implementation: String },

    #[error("Implementation '{0}' is already registered")]
    DuplicateImplementation(String),

    #[error("Could not resolve configuration for step '{step_id}': {message}")]
    Resolve { step_id: String, message: String },

    #[error("Backend is not prepared")]
    NotPrepared,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Category used when this error ends a run.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Manifest(_)
            | Self::Config(_)
            | Self::UnknownImplementation { .. }
            | Self::DuplicateImplementation(_)
            | Self::Resolve { .. } => ErrorCategory::Validation,
            Self::Store(err) => err.category(),
            Self::Sandbox(err) => err.category(),
            Self::Rpc(err) => err.category(),
            Self::NotPrepared | Self::Io(_) | Self::Json(_) => ErrorCategory::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_and_timeout_retry() {
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::Auth.is_retryable());
        assert!(!ErrorCategory::Permission.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::Permission).unwrap();
        assert_eq!(json, "\"permission\"");
        let back: ErrorCategory = serde_json::from_str("\"network\"").unwrap();
        assert_eq!(back, ErrorCategory::Network);
    }

    #[test]
    fn test_missing_input_names_upstream() {
        let err = StepError::missing_input("extract");
        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(err.upstream.as_deref(), Some("extract"));
        assert!(err.to_string().contains("extract"));
    }

    #[test]
    fn test_step_error_display() {
        let err = StepError::network("connection reset");
        assert_eq!(err.to_string(), "network: connection reset");
    }

    #[test]
    fn test_map_message_keeps_category() {
        let err = StepError::auth("token=abc").map_message(|m| m.replace("abc", "***"));
        assert_eq!(err.category, ErrorCategory::Auth);
        assert_eq!(err.message, "token=***");
    }

    #[test]
    fn test_engine_error_categories() {
        let err = EngineError::UnknownImplementation {
            step_id: "a".into(),
            implementation: "nope".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(EngineError::NotPrepared.category(), ErrorCategory::Unknown);
    }
}
