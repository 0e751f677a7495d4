//! Error types for the backup sidecar.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup-fatal configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failure talking to the live game server.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control directive rejected: {0}")]
    Rejected(String),

    #[error("Control channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RCON error: {0}")]
    Rcon(String),
}

#[derive(Error, Debug)]
pub enum QuiesceError {
    #[error("Quiesce not acknowledged within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Channel(#[from] ControlError),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Source directory missing or not a directory: {0}")]
    SourceMissing(PathBuf),

    #[error("Insufficient disk space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Partial write: expected {expected} bytes on disk, found {written}")]
    PartialWrite { expected: u64, written: u64 },

    #[error("Capture task failed: {0}")]
    Task(String),
}

/// A single remote-store call failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Remote store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Status { status, body } => match *status {
                408 | 429 => true,
                403 => body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded"),
                s => (500..600).contains(&s),
            },
            StoreError::Network(_) | StoreError::Timeout => true,
            StoreError::Auth(_) | StoreError::Io(_) | StoreError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if err.is_decode() {
            StoreError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            StoreError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            StoreError::Network(err.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Upload failed after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    #[error("Upload rejected after {attempts} attempt(s): {message}")]
    Permanent { attempts: u32, message: String },
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transient { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            UploadError::Transient { attempts, .. } | UploadError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Rejections surfaced to callers of the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("A backup is already running")]
    Busy,

    #[error("Requester is not authorized")]
    Forbidden,

    #[error("Backup job aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
