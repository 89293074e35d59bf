// src/error.rs

//! Unified error handling for the pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// CSV export failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error; fatal before the first cycle
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record or input validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A backend does not implement the requested capability
    #[error("{backend} storage does not support {capability}")]
    Unsupported {
        backend: &'static str,
        capability: &'static str,
    },

    /// Short-term backend error
    #[error("Storage error on {target}: {message}")]
    Storage { target: String, message: String },

    /// Scraper collaborator failed for a chain
    #[error("Fetch error for {chain}: {message}")]
    Fetch { chain: String, message: String },

    /// A staged file could not be turned into a record
    #[error("Conversion error for {file}: {message}")]
    Conversion { file: String, message: String },

    /// Long-term host error
    #[error("Publish error: {0}")]
    Publish(String),

    /// AWS S3 error
    #[error("S3 error: {0}")]
    S3(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an unsupported-capability error.
    pub fn unsupported(backend: &'static str, capability: &'static str) -> Self {
        Self::Unsupported {
            backend,
            capability,
        }
    }

    /// Create a storage error for a target.
    pub fn storage(target: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Storage {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Create a fetch error for a chain.
    pub fn fetch(chain: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Fetch {
            chain: chain.into(),
            message: message.to_string(),
        }
    }

    /// Create a conversion error for a staged file.
    pub fn conversion(file: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Conversion {
            file: file.into(),
            message: message.to_string(),
        }
    }

    /// Create a publish error.
    pub fn publish(message: impl fmt::Display) -> Self {
        Self::Publish(message.to_string())
    }

    /// Whether this error reports a missing capability rather than a fault.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Failure categories an operation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Conversion,
    StorageWrite,
    Publish,
    Cleanup,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Fetch => "fetch",
            FailureKind::Conversion => "conversion",
            FailureKind::StorageWrite => "storage_write",
            FailureKind::Publish => "publish",
            FailureKind::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_message() {
        let err = AppError::unsupported("broker", "read_records");
        assert!(err.is_unsupported());
        assert_eq!(
            err.to_string(),
            "broker storage does not support read_records"
        );
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::StorageWrite.to_string(), "storage_write");
    }
}
