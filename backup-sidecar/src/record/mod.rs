//! Backup records: one per snapshot attempt.

pub mod index;

pub use index::RecordIndex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Regular,
    Archive,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Regular => f.write_str("regular"),
            BackupKind::Archive => f.write_str("archive"),
        }
    }
}

/// Pipeline position of a record. Variants are declared in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Quiescing,
    Capturing,
    CapturedLocal,
    Uploading,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Failed)
    }

    fn next(self) -> Option<BackupStatus> {
        match self {
            BackupStatus::Pending => Some(BackupStatus::Quiescing),
            BackupStatus::Quiescing => Some(BackupStatus::Capturing),
            BackupStatus::Capturing => Some(BackupStatus::CapturedLocal),
            BackupStatus::CapturedLocal => Some(BackupStatus::Uploading),
            BackupStatus::Uploading => Some(BackupStatus::Completed),
            BackupStatus::Completed | BackupStatus::Failed => None,
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Quiescing => "quiescing",
            BackupStatus::Capturing => "capturing",
            BackupStatus::CapturedLocal => "captured_local",
            BackupStatus::Uploading => "uploading",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    QuiesceTimeout,
    Quiesce(String),
    Capture(String),
    UploadExhausted,
    UploadRejected(String),
    /// The process stopped while the record was in flight.
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::QuiesceTimeout => f.write_str("quiesce timed out"),
            FailureReason::Quiesce(msg) => write!(f, "quiesce failed: {}", msg),
            FailureReason::Capture(msg) => write!(f, "capture failed: {}", msg),
            FailureReason::UploadExhausted => f.write_str("upload retries exhausted"),
            FailureReason::UploadRejected(msg) => write!(f, "upload rejected: {}", msg),
            FailureReason::Interrupted => f.write_str("interrupted by restart"),
        }
    }
}

/// Location of an uploaded copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRef {
    pub remote_id: String,
    pub folder_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: BackupStatus,
    pub to: BackupStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal status transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub local_path: Option<PathBuf>,
    pub remote_path: Option<RemoteRef>,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub status: BackupStatus,
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub upload_attempts: u32,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    pub fn new(kind: BackupKind, created_at: DateTime<Utc>, requested_by: Option<String>) -> Self {
        Self {
            id: make_id(created_at),
            kind,
            created_at,
            local_path: None,
            remote_path: None,
            size_bytes: 0,
            checksum: None,
            status: BackupStatus::Pending,
            failure_reason: None,
            upload_attempts: 0,
            requested_by,
            finished_at: None,
        }
    }

    /// Move one step forward in the pipeline.
    ///
    /// Only the immediate successor is accepted; `Completed` and `Failed`
    /// are terminal. Use [`BackupRecord::fail`] to abort.
    pub fn advance(&mut self, to: BackupStatus) -> Result<(), TransitionError> {
        if to == BackupStatus::Failed || self.status.next() != Some(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Terminate with `reason`. Rejected once the record is terminal.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to: BackupStatus::Failed,
            });
        }
        self.status = BackupStatus::Failed;
        self.failure_reason = Some(reason);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `<prefix>-<id>-<kind>.tar.zst`
    pub fn artifact_name(&self, prefix: &str) -> String {
        format!("{}-{}-{}.tar.zst", prefix, self.id, self.kind)
    }
}

/// Time-derived, lexicographically sortable id: `YYYYMMDD_HHMMSS_mmm-xxxxxxxx`.
pub fn make_id(at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", at.format("%Y%m%d_%H%M%S_%3f"), &suffix[..8])
}

/// Newest first by `created_at`, ties broken by id.
pub fn newest_first(a: &BackupRecord, b: &BackupRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}
