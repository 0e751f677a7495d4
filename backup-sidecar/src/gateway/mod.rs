//! Inbound chat commands: authorization and dispatch.

pub mod discord;

use crate::health::HealthReporter;
use crate::notify::{announce, Event, EventKind, Notifier};
use crate::record::BackupRecord;
use crate::scheduler::Scheduler;
use crate::utils::errors::EngineError;
use crate::utils::format_bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

const LISTED_BACKUPS: usize = 10;

/// A chat command with the requester's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundCommand {
    pub command: String,
    pub requester_id: String,
    pub requester_roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Trigger,
    Backups,
    Status,
    Ping,
    Unknown(String),
}

impl Command {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "trigger" | "backup-now" => Command::Trigger,
            "backups" | "backup" => Command::Backups,
            "status" => Command::Status,
            "ping" => Command::Ping,
            other => Command::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Answer with a message whose round trip the transport measures.
    Pong,
}

pub struct CommandGateway {
    scheduler: Arc<Scheduler>,
    health: HealthReporter,
    notifier: Arc<dyn Notifier>,
    authorized_roles: HashSet<String>,
}

impl CommandGateway {
    pub fn new(
        scheduler: Arc<Scheduler>,
        health: HealthReporter,
        notifier: Arc<dyn Notifier>,
        authorized_roles: HashSet<String>,
    ) -> Self {
        Self {
            scheduler,
            health,
            notifier,
            authorized_roles,
        }
    }

    pub fn is_authorized(&self, roles: &[String]) -> bool {
        roles.iter().any(|role| self.authorized_roles.contains(role))
    }

    /// Authorize and execute one command.
    pub async fn handle(&self, inbound: &InboundCommand) -> Result<Reply, EngineError> {
        if !self.is_authorized(&inbound.requester_roles) {
            announce(
                self.notifier.as_ref(),
                Event::new(EventKind::Forbidden).with_detail(format!(
                    "{} tried `{}`",
                    inbound.requester_id, inbound.command
                )),
            )
            .await;
            return Err(EngineError::Forbidden);
        }

        let command = Command::parse(&inbound.command);
        info!(requester = %inbound.requester_id, command = ?command, "Handling command");
        match command {
            Command::Trigger => {
                match self
                    .scheduler
                    .trigger_manual(Some(inbound.requester_id.clone()))
                    .await
                {
                    Ok(record) => Ok(Reply::Text(describe(&record))),
                    Err(EngineError::Busy) => {
                        announce(
                            self.notifier.as_ref(),
                            Event::new(EventKind::Busy)
                                .with_detail(format!("requested by {}", inbound.requester_id)),
                        )
                        .await;
                        Err(EngineError::Busy)
                    }
                    Err(e) => Err(e),
                }
            }
            Command::Backups => {
                let records = self.scheduler.records().await;
                if records.is_empty() {
                    return Ok(Reply::Text("No backups yet.".to_string()));
                }
                let lines: Vec<String> = records.iter().take(LISTED_BACKUPS).map(describe).collect();
                Ok(Reply::Text(lines.join("\n")))
            }
            Command::Status => Ok(Reply::Text(self.health.summary().await)),
            Command::Ping => Ok(Reply::Pong),
            Command::Unknown(_) => Ok(Reply::Text("Sorry, that command does not exist.".to_string())),
        }
    }
}

/// One listing line: id, kind, status, size and where copies live.
pub fn describe(record: &BackupRecord) -> String {
    let mut copies = Vec::new();
    if record.local_path.is_some() {
        copies.push("local");
    }
    if record.remote_path.is_some() {
        copies.push("drive");
    }
    let copies = if copies.is_empty() {
        "none".to_string()
    } else {
        copies.join("+")
    };
    let mut line = format!(
        "`{}` {} {} {} [{}]",
        record.id,
        record.kind,
        record.status,
        format_bytes(record.size_bytes),
        copies
    );
    if let Some(reason) = &record.failure_reason {
        line.push_str(&format!(" ({})", reason));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveMode;
    use crate::coordinator::Coordinator;
    use crate::record::RecordIndex;
    use crate::retention::RetentionPolicy;
    use crate::scheduler::SchedulerSettings;
    use crate::snapshot::SnapshotEngine;
    use crate::test_support::{FakeControl, MemoryStore, RecordingNotifier};
    use crate::upload::{RetryPolicy, Uploader};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        gateway: CommandGateway,
        scheduler: Arc<Scheduler>,
        control: Arc<FakeControl>,
        notifier: Arc<RecordingNotifier>,
        _dirs: (TempDir, TempDir),
    }

    fn fixture() -> Fixture {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("level.dat"), b"world").unwrap();
        let staging = TempDir::new().unwrap();
        let control = Arc::new(FakeControl::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let scheduler = Arc::new(Scheduler::new(
            SchedulerSettings {
                data_dir: source.path().to_path_buf(),
                artifact_prefix: "MineCraftBackup".into(),
                interval: Duration::from_secs(1800),
                archive_check: Duration::from_secs(3600),
                remote_root: "root".into(),
            },
            RetentionPolicy {
                keep_count: 5,
                archive_every: chrono::Duration::days(7),
                archive_mode: ArchiveMode::Replace,
            },
            Coordinator::new(control.clone(), Duration::from_secs(10)),
            SnapshotEngine::new(staging.path(), "MineCraftBackup", 3),
            Uploader::new(
                Arc::new(MemoryStore::new()),
                RetryPolicy {
                    max_attempts: 3,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(4),
                    attempt_timeout: Duration::from_secs(30),
                },
            ),
            notifier.clone(),
            RecordIndex::load(staging.path()).unwrap(),
        ));
        let health = HealthReporter::new(scheduler.status_handle(), Duration::from_secs(1800), 3);
        let roles = ["admin", "mod"].iter().map(|s| s.to_string()).collect();
        let gateway = CommandGateway::new(scheduler.clone(), health, notifier.clone(), roles);

        Fixture {
            gateway,
            scheduler,
            control,
            notifier,
            _dirs: (source, staging),
        }
    }

    fn command(name: &str, roles: &[&str]) -> InboundCommand {
        InboundCommand {
            command: name.to_string(),
            requester_id: "1234".to_string(),
            requester_roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_trigger_is_forbidden() {
        let f = fixture();
        let result = f.gateway.handle(&command("trigger", &["member"])).await;

        assert_eq!(result, Err(EngineError::Forbidden));
        assert!(f.scheduler.records().await.is_empty());
        assert_eq!(f.control.pauses(), 0);
        assert_eq!(f.notifier.kinds(), vec![EventKind::Forbidden]);
    }

    #[tokio::test]
    async fn test_authorized_trigger_runs_backup() {
        let f = fixture();
        let reply = f.gateway.handle(&command("backup-now", &["member", "mod"])).await.unwrap();

        match reply {
            Reply::Text(text) => assert!(text.contains("completed"), "{}", text),
            other => panic!("unexpected reply {:?}", other),
        }
        let records = f.scheduler.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].requested_by.as_deref(), Some("1234"));

        let listing = f.gateway.handle(&command("backups", &["admin"])).await.unwrap();
        assert!(matches!(listing, Reply::Text(ref t) if t.contains(&records[0].id)));
    }

    #[tokio::test]
    async fn test_status_ping_and_unknown() {
        let f = fixture();
        let status = f.gateway.handle(&command("status", &["admin"])).await.unwrap();
        assert!(matches!(status, Reply::Text(ref t) if t.starts_with("healthy")));

        assert_eq!(f.gateway.handle(&command("PING", &["admin"])).await, Ok(Reply::Pong));
        assert_eq!(
            f.gateway.handle(&command("restore", &["admin"])).await,
            Ok(Reply::Text("Sorry, that command does not exist.".to_string()))
        );
    }

    #[test]
    fn test_inbound_wire_shape() {
        let inbound: InboundCommand = serde_json::from_str(
            r#"{"command":"trigger","requesterId":"42","requesterRoles":["admin"]}"#,
        )
        .unwrap();
        assert_eq!(inbound.requester_roles, vec!["admin"]);
    }
}
