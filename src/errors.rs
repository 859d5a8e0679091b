//! # Error Handling Module
//!
//! ## Purpose
//! Centralized error handling for the crawl scheduler, providing structured
//! error types and conversion utilities for all system components.
//!
//! ## Input/Output Specification
//! - **Input**: Error conditions from transport, storage, and orchestration
//! - **Output**: Structured error types with context and error chains
//! - **Error Categories**: Transport, Session, Store, Registry, Config, Orchestration
//!
//! ## Propagation policy
//! Per-node business failures (double transport faults, unexpected response
//! shapes, exhausted server-error budgets) are absorbed into the node's
//! `FAILED` status and never abort the run. Only errors raised from the
//! orchestration scope itself (storage faults, pool shutdown, task panics)
//! propagate out of `Spider::run` and mark the run `FAILED`.

use thiserror::Error;

/// Result type used throughout the application
pub type Result<T> = std::result::Result<T, SpiderError>;

/// Error types for the crawl scheduler
#[derive(Debug, Error)]
pub enum SpiderError {
    /// Network-level transport failures (after the transport's own retry)
    #[error("Network error: {details}")]
    Network { details: String },

    /// A success response whose body did not match the expected shape
    #[error("Unexpected response content from {url}: {details}")]
    UnexpectedContent { url: String, details: String },

    /// Session renewal could not restore an authenticated session
    #[error("Session renewal failed: {details}")]
    SessionRenewal { details: String },

    /// The session pool was closed while a node still needed a session
    #[error("Session pool is closed")]
    PoolClosed,

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation failed for field '{field}': {reason}")]
    ValidationFailed { field: String, reason: String },

    /// Run store / registry database errors
    #[error("Store error during {operation}: {details}")]
    Store { operation: String, details: String },

    /// Serialization/deserialization errors
    #[error("Serialization failed: {message}")]
    SerializationFailed { message: String },

    /// No persisted state exists for the requested run
    #[error("Run '{run_id}' not found in the run store")]
    RunNotFound { run_id: String },

    /// Attempted to resume a run that already finished cleanly
    #[error("Run '{run_id}' is already complete")]
    RunComplete { run_id: String },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SpiderError {
    /// Check if the error is recoverable (worth retrying)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SpiderError::Network { .. } | SpiderError::SessionRenewal { .. })
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            SpiderError::Network { .. }
            | SpiderError::UnexpectedContent { .. }
            | SpiderError::SessionRenewal { .. } => "transport",
            SpiderError::PoolClosed => "session",
            SpiderError::Config { .. } | SpiderError::ValidationFailed { .. } => "configuration",
            SpiderError::Store { .. }
            | SpiderError::SerializationFailed { .. }
            | SpiderError::RunNotFound { .. }
            | SpiderError::RunComplete { .. } => "storage",
            SpiderError::Internal { .. } => "orchestration",
        }
    }
}

// Conversion from common error types
impl From<std::io::Error> for SpiderError {
    fn from(err: std::io::Error) -> Self {
        SpiderError::Store {
            operation: "io".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for SpiderError {
    fn from(err: reqwest::Error) -> Self {
        SpiderError::Network {
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SpiderError {
    fn from(err: serde_json::Error) -> Self {
        SpiderError::SerializationFailed {
            message: format!("JSON serialization error: {}", err),
        }
    }
}

impl From<bincode::Error> for SpiderError {
    fn from(err: bincode::Error) -> Self {
        SpiderError::SerializationFailed {
            message: format!("Binary serialization error: {}", err),
        }
    }
}

impl From<sled::Error> for SpiderError {
    fn from(err: sled::Error) -> Self {
        SpiderError::Store {
            operation: "sled".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for SpiderError {
    fn from(err: toml::de::Error) -> Self {
        SpiderError::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}
