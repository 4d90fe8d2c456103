//! Error taxonomy shared by the catalog, download, and apply paths.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure raised by a core operation.
///
/// Variants are cheap to clone so a single failure can be reported to the task registry and the
/// completion channel at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("network error: {message}")]
    Network { transient: bool, status: Option<u16>, message: String },

    #[error("rate limited by the catalog (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("checksum mismatch: expected {expected} bytes, received {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("failed to write {}: {message}", .path.display())]
    DiskWrite { path: PathBuf, message: String },

    #[error("asset {} does not exist", .0.display())]
    AssetMissing(PathBuf),

    #[error("desktop environment `{0}` is not supported")]
    EnvironmentUnsupported(String),

    #[error("`{program}` exited with {status}: {stderr}")]
    ApplyCommandFailed { program: String, status: String, stderr: String },

    #[error("wallpaper verification failed: expected {}, desktop reports {actual:?}", .expected.display())]
    ApplyVerificationFailed { expected: PathBuf, actual: Option<PathBuf> },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl CoreError {
    /// Build the error matching a non-success HTTP status.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => CoreError::RateLimited { retry_after },
            500..=599 => CoreError::Network {
                transient: true,
                status: Some(status),
                message: format!("HTTP {status} server error"),
            },
            _ => CoreError::Network {
                transient: false,
                status: Some(status),
                message: format!("HTTP {status} request rejected"),
            },
        }
    }

    pub fn disk_write(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        CoreError::DiskWrite { path: path.into(), message: err.to_string() }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Network { transient, .. } => *transient,
            CoreError::RateLimited { .. } | CoreError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Server supplied wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Terminal failure with the context a UI needs to render an actionable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed for `{subject}` after {attempts} attempt(s): {source}")]
pub struct OperationError {
    pub operation: &'static str,
    pub subject: String,
    pub attempts: u32,
    #[source]
    pub source: CoreError,
}

impl OperationError {
    pub fn new(
        operation: &'static str,
        subject: impl Into<String>,
        attempts: u32,
        source: CoreError,
    ) -> Self {
        Self { operation, subject: subject.into(), attempts, source }
    }
}
