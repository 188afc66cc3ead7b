//! Custom error types for the fly-scan stack.
//!
//! This module defines the primary error type, `DaqError`, used by every layer of the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the failures that can occur while staging, running and collecting a fly scan.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading the TOML/env configuration.
//! - **`Configuration`**: Semantic setup errors such as a non-positive sample target or
//!   missing trajectory metadata. Fatal to the call, never retried.
//! - **`AlreadyRunning`**: A device singleton was claimed twice. The caller may wait or
//!   pick another device.
//! - **`Transfer`**: The remote acquisition host could not be reached or the copy failed.
//!   See [`TransferError`]; transfers are never retried automatically.
//! - **`MalformedFile`** / **`MissingMetadata`**: Raised by the record decoder.
//! - **`Precondition`**: An orchestrator operation was called from the wrong state.
//! - **`Timeout`**: A watchdog expired while waiting on a completion status.
//!
//! Every message names the offending device, host or path.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::status::StatusError;

// =============================================================================
// Transfer Errors
// =============================================================================

/// Category of a failed remote file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Host refused the connection, did not resolve, or did not answer.
    Unreachable,
    /// The host answered but rejected our credentials.
    Authentication,
    /// Connected, but the copy itself failed (missing file, partial write).
    Transfer,
}

impl std::fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransferErrorKind::Unreachable => "unreachable",
            TransferErrorKind::Authentication => "authentication",
            TransferErrorKind::Transfer => "transfer",
        };
        write!(f, "{}", label)
    }
}

/// A failed copy of acquisition files from the device host.
#[derive(Error, Debug, Clone)]
#[error("Transfer of '{path}' from host '{host}' failed ({kind}): {message}")]
pub struct TransferError {
    /// Host the files were requested from.
    pub host: String,
    /// Remote path being copied when the failure happened.
    pub path: String,
    /// Failure category.
    pub kind: TransferErrorKind,
    /// Human readable detail, usually the transport's stderr.
    pub message: String,
}

impl TransferError {
    /// Create a transfer error of the given kind.
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        kind: TransferErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    /// The host could not be reached at all.
    pub fn unreachable(
        host: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(host, path, TransferErrorKind::Unreachable, message)
    }

    /// The host rejected the login. Carries the remediation hint operators expect.
    pub fn authentication(
        host: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = format!(
            "{}. SSH connection could not be established. Create SSH keys",
            message.into().trim_end_matches('.')
        );
        Self::new(host, path, TransferErrorKind::Authentication, message)
    }

    /// Whether a caller could reasonably retry this transfer unchanged.
    ///
    /// Always `false`: a silently retried transfer can hand back stale files
    /// from a previous run.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// Application Error
// =============================================================================

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the fly-scan stack.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration or setup values are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The device is already claimed by another run.
    #[error("Device '{device}' is already running")]
    AlreadyRunning {
        /// Name of the busy device.
        device: String,
    },

    /// Remote file retrieval failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The binary acquisition file does not match the expected layout.
    #[error("Malformed acquisition file '{}': {reason}", path.display())]
    MalformedFile {
        /// Offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The sibling settings file is absent or truncated.
    #[error("Missing metadata for '{}': {reason}", path.display())]
    MissingMetadata {
        /// Expected metadata file.
        path: PathBuf,
        /// What was missing.
        reason: String,
    },

    /// An operation was called from a state that does not allow it.
    #[error("Cannot {operation} while {state}")]
    Precondition {
        /// Rejected operation.
        operation: &'static str,
        /// State description at the time of the call.
        state: String,
    },

    /// A watchdog expired.
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited on.
        what: String,
        /// Watchdog duration.
        after: Duration,
    },

    /// A completion status resolved with a failure.
    #[error("Status failed: {0}")]
    StatusFailed(String),

    /// Hardware channel access failed.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Document serialization failed.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaqError {
    /// Whether the caller can recover without changing configuration or hardware.
    ///
    /// Mirrors the `can_recover` flag the core error carries: busy devices and
    /// out-of-order calls are recoverable, everything else needs intervention.
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            DaqError::AlreadyRunning { .. } | DaqError::Precondition { .. }
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<StatusError> for DaqError {
    fn from(value: StatusError) -> Self {
        match value {
            StatusError::TimedOut { label, after } => DaqError::Timeout { what: label, after },
            other => DaqError::StatusFailed(other.to_string()),
        }
    }
}
