//! Error types for ebsvol.

use std::fmt;
use std::io;

use thiserror::Error;

/// Resource type name used in fetch errors and log lines.
pub const RESOURCE_TYPE: &str = "ec2_volume";

/// Error code EC2 returns when a caller is throttled.
pub const REQUEST_LIMIT_EXCEEDED: &str = "RequestLimitExceeded";

/// A failed remote call, as reported by an EC2 backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Operation that failed, e.g. `CreateVolume`.
    pub operation: String,
    /// Service error code, e.g. `RequestLimitExceeded`. Empty when the
    /// failure happened before a response was received.
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{} failed: {}", self.operation, self.message)
        } else {
            write!(f, "{} failed ({}): {}", self.operation, self.code, self.message)
        }
    }
}

impl std::error::Error for ApiError {}

/// Main error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Fetching {resource_type} data failed in region {region}: {message}")]
    FetchFailed {
        region: String,
        resource_type: String,
        message: String,
    },

    #[error("EC2 API error: {0}")]
    Api(#[from] ApiError),

    #[error("No completed snapshot found with label '{label}'")]
    SnapshotNotFound { label: String },

    #[error("Volume '{name}' has no known volume id")]
    MissingVolumeId { name: String },

    #[error("Invalid resource '{name}': {reason}")]
    InvalidResource { name: String, reason: String },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn fetch_failed(region: impl Into<String>, message: impl Into<String>) -> Self {
        Error::FetchFailed {
            region: region.into(),
            resource_type: RESOURCE_TYPE.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_resource(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidResource {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Service error code, if this error came from a remote call.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Error::Api(e) if !e.code.is_empty() => Some(&e.code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
