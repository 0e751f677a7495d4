//! Retention and archive promotion.
//!
//! Two independent passes, both idempotent:
//! - the local pass deletes staged artifacts outside the retention window,
//!   and archives once their remote copy exists;
//! - the remote pass trims the `Retention` and `Archive` folders.

use crate::config::{ArchiveMode, RetentionConfig};
use crate::record::{newest_first, BackupKind, BackupRecord, BackupStatus};
use crate::snapshot::checksum_path;
use crate::upload::{RemoteObject, RemoteStore};
use crate::utils::errors::StoreError;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub keep_count: usize,
    pub archive_every: chrono::Duration,
    pub archive_mode: ArchiveMode,
}

impl RetentionPolicy {
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self {
            keep_count: config.keep_count,
            archive_every: chrono::Duration::days(i64::from(config.archive_every_days)),
            archive_mode: config.archive_mode,
        }
    }

    /// True when no archive has completed yet or the last one is old enough.
    pub fn archive_due(&self, last_archive: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_archive {
            None => true,
            Some(last) => now - last >= self.archive_every,
        }
    }

    fn archives_to_keep(&self) -> Option<usize> {
        match self.archive_mode {
            ArchiveMode::Replace => Some(1),
            ArchiveMode::Accumulate => None,
        }
    }
}

/// Ids of records whose local artifact should be deleted.
pub fn plan_local(records: &[BackupRecord], policy: &RetentionPolicy) -> Vec<String> {
    let mut candidates: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| r.is_terminal() && r.local_path.is_some())
        .collect();
    candidates.sort_by(|a, b| newest_first(a, b));

    let newest_completed_archive = records
        .iter()
        .filter(|r| r.kind == BackupKind::Archive && r.status == BackupStatus::Completed)
        .max_by(|a, b| newest_first(b, a));

    let mut delete = Vec::new();
    let mut regular_kept = 0;
    for record in candidates {
        match record.kind {
            BackupKind::Regular => {
                if regular_kept < policy.keep_count {
                    regular_kept += 1;
                } else {
                    delete.push(record.id.clone());
                }
            }
            BackupKind::Archive => {
                let superseded = match newest_completed_archive {
                    Some(latest) => newest_first(latest, record).is_lt(),
                    None => false,
                };
                if record.status == BackupStatus::Completed || superseded {
                    delete.push(record.id.clone());
                }
            }
        }
    }
    delete
}

#[derive(Debug, Default)]
pub struct LocalReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Delete local artifacts selected by [`plan_local`].
///
/// A record keeps its `local_path` when deletion fails so the next pass
/// retries it.
pub fn prune_local(records: &mut [BackupRecord], policy: &RetentionPolicy) -> LocalReport {
    let plan: HashSet<String> = plan_local(records, policy).into_iter().collect();
    let mut report = LocalReport::default();

    for record in records.iter_mut().filter(|r| plan.contains(&r.id)) {
        let Some(path) = record.local_path.clone() else {
            continue;
        };
        match remove_artifact(&path) {
            Ok(()) => {
                info!(record_id = %record.id, kind = %record.kind, path = %path.display(), "Pruned local artifact");
                record.local_path = None;
                report.removed.push(record.id.clone());
            }
            Err(e) => {
                warn!(record_id = %record.id, path = %path.display(), error = %e, "Failed to prune local artifact");
                report.failed.push((record.id.clone(), e.to_string()));
            }
        }
    }
    report
}

fn remove_artifact(path: &Path) -> io::Result<()> {
    for target in [path.to_path_buf(), checksum_path(path)] {
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Remote sub-folders under the configured destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolders {
    pub retention: String,
    pub archive: String,
}

impl RemoteFolders {
    pub const RETENTION: &'static str = "Retention";
    pub const ARCHIVE: &'static str = "Archive";

    pub fn for_kind(&self, kind: BackupKind) -> &str {
        match kind {
            BackupKind::Regular => &self.retention,
            BackupKind::Archive => &self.archive,
        }
    }
}

/// Objects to delete: everything carrying `prefix` beyond the `keep` newest
/// by (`created_at`, name).
pub fn plan_remote(objects: &[RemoteObject], keep: usize, prefix: &str) -> Vec<RemoteObject> {
    let mut ours: Vec<&RemoteObject> = objects
        .iter()
        .filter(|o| o.name.starts_with(prefix))
        .collect();
    ours.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });
    ours.into_iter().skip(keep).cloned().collect()
}

#[derive(Debug, Default)]
pub struct RemoteReport {
    pub deleted: Vec<RemoteObject>,
    pub failed: Vec<(RemoteObject, String)>,
}

pub async fn prune_remote(
    store: &dyn RemoteStore,
    folders: &RemoteFolders,
    policy: &RetentionPolicy,
    prefix: &str,
) -> Result<RemoteReport, StoreError> {
    let mut report = RemoteReport::default();

    let regular = store.list(&folders.retention).await?;
    let mut doomed = plan_remote(&regular, policy.keep_count, prefix);

    if let Some(keep) = policy.archives_to_keep() {
        let archives = store.list(&folders.archive).await?;
        doomed.extend(plan_remote(&archives, keep, prefix));
    }

    for object in doomed {
        match store.delete(&object.remote_id).await {
            Ok(()) => {
                info!(name = %object.name, remote_id = %object.remote_id, "Pruned remote backup");
                report.deleted.push(object);
            }
            Err(e) => {
                warn!(name = %object.name, error = %e, "Failed to prune remote backup");
                report.failed.push((object, e.to_string()));
            }
        }
    }
    Ok(report)
}

/// Clear `remote_path` on records whose remote object was deleted.
pub fn apply_remote_report(records: &mut [BackupRecord], report: &RemoteReport) {
    let deleted: HashSet<&str> = report.deleted.iter().map(|o| o.remote_id.as_str()).collect();
    for record in records.iter_mut() {
        let gone = record
            .remote_path
            .as_ref()
            .is_some_and(|r| deleted.contains(r.remote_id.as_str()));
        if gone {
            debug!(record_id = %record.id, "Remote copy pruned");
            record.remote_path = None;
        }
    }
}

/// Drop terminal records that have neither a local nor a remote copy.
///
/// The newest `keep_count` records of each kind stay as history even when
/// they have no copy, so recent failures remain listable.
pub fn drop_orphans(records: &mut Vec<BackupRecord>, keep_count: usize) -> usize {
    let mut ordered: Vec<&BackupRecord> = records.iter().collect();
    ordered.sort_by(|a, b| newest_first(a, b));

    let mut history: HashSet<String> = HashSet::new();
    for kind in [BackupKind::Regular, BackupKind::Archive] {
        history.extend(
            ordered
                .iter()
                .filter(|r| r.kind == kind)
                .take(keep_count)
                .map(|r| r.id.clone()),
        );
    }

    let before = records.len();
    records.retain(|r| {
        !r.is_terminal()
            || r.local_path.is_some()
            || r.remote_path.is_some()
            || history.contains(&r.id)
    });
    before - records.len()
}
