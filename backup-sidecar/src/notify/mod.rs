//! Outbound notifications.

pub mod webhook;

pub use webhook::{ChannelNotifier, WebhookNotifier};

use crate::record::{BackupKind, BackupRecord, BackupStatus};
use crate::utils::errors::NotificationError;
use crate::utils::format_bytes;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Online,
    Started,
    Completed,
    Failed,
    Busy,
    Forbidden,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Online => "online",
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Busy => "busy",
            EventKind::Forbidden => "forbidden",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_kind: EventKind,
    pub record_id: Option<String>,
    pub kind: Option<BackupKind>,
    pub status: Option<BackupStatus>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_kind: EventKind) -> Self {
        Self {
            event_kind,
            record_id: None,
            kind: None,
            status: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_record(event_kind: EventKind, record: &BackupRecord) -> Self {
        Self {
            record_id: Some(record.id.clone()),
            kind: Some(record.kind),
            status: Some(record.status),
            ..Self::new(event_kind)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// One-line human description.
    pub fn summary(&self) -> String {
        let subject = match (&self.record_id, self.kind) {
            (Some(id), Some(kind)) => format!("{} backup `{}`", kind, id),
            _ => "Backup".to_string(),
        };
        let headline = match self.event_kind {
            EventKind::Online => "Backup sidecar is online".to_string(),
            EventKind::Started => format!("{} started", subject),
            EventKind::Completed => format!("{} completed", subject),
            EventKind::Failed => format!("{} failed", subject),
            EventKind::Busy => "A backup is already running; request ignored".to_string(),
            EventKind::Forbidden => "Unauthorized command rejected".to_string(),
        };
        match &self.detail {
            Some(detail) => format!("{}: {}", headline, detail),
            None => headline,
        }
    }
}

/// Detail line for a finished record.
pub fn record_detail(record: &BackupRecord) -> String {
    match (&record.failure_reason, record.status) {
        (Some(reason), _) => reason.to_string(),
        (None, BackupStatus::Completed) => format!(
            "{} uploaded in {} attempt(s)",
            format_bytes(record.size_bytes),
            record.upload_attempts
        ),
        (None, status) => status.to_string(),
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn emit(&self, event: &Event) -> Result<(), NotificationError>;
}

/// Delivers every event to each sink in turn.
pub struct Fanout {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Notifier for Fanout {
    async fn emit(&self, event: &Event) -> Result<(), NotificationError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Log and deliver `event`. Delivery failures are logged and dropped.
pub async fn announce(notifier: &dyn Notifier, event: Event) {
    info!(
        event = %event.event_kind,
        record_id = event.record_id.as_deref().unwrap_or("-"),
        "{}",
        event.summary()
    );
    if let Err(e) = notifier.emit(&event).await {
        warn!(event = %event.event_kind, error = %e, "Notification delivery failed");
    }
}
