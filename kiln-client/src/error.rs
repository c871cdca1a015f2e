//! Error types for the transfer client

use std::path::PathBuf;

use kiln_core::Cancelled;
use thiserror::Error;

/// Result type alias for a single API call
pub type Result<T> = std::result::Result<T, ClientError>;

/// Status codes the retry policy treats as transient.
pub const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Errors from a single HTTP call to the object store or image registry
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Base URL cannot carry path segments
    #[error("invalid base URL: {0}")]
    InvalidUrl(String),

    /// No bearer token in the configured environment variable
    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Throttling, transient server errors and connection-level failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ApiError { status, .. } => RETRYABLE_STATUS.contains(status),
            Self::RequestFailed(err) => {
                err.status().is_none() && (err.is_connect() || err.is_timeout())
            }
            _ => false,
        }
    }
}

/// Errors from the upload, import and wait protocols
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("image artifact not found: {} (run build first)", .path.display())]
    ArtifactNotFound { image: String, path: PathBuf },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload of {object} failed: {source}")]
    UploadFailed {
        object: String,
        #[source]
        source: Box<TransferError>,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    TransientNetwork {
        operation: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    #[error("{operation} failed: {source}")]
    Api {
        operation: String,
        #[source]
        source: ClientError,
    },

    #[error("unexpected state for image {image}: {state}")]
    UnexpectedImageState { image: String, state: String },

    #[error("timeout waiting for image {image} after {elapsed_secs}s")]
    ImportTimeout { image: String, elapsed_secs: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for TransferError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::UploadFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
