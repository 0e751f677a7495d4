//! Persisted record index (`index.json` in the staging directory).

use super::{newest_first, BackupKind, BackupRecord, BackupStatus, FailureReason};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    records: Vec<BackupRecord>,
}

#[derive(Debug)]
pub struct RecordIndex {
    path: PathBuf,
    records: Vec<BackupRecord>,
}

impl RecordIndex {
    /// Load the index from `dir`, creating an empty one if absent.
    ///
    /// Records left in a non-terminal status by a previous process are
    /// marked `Failed(Interrupted)` and the index is rewritten.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating staging directory {}", dir.display()))?;
        let path = dir.join(INDEX_FILE);

        let file: IndexFile = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexFile::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        let mut index = Self {
            path,
            records: file.records,
        };

        let mut interrupted = 0;
        for record in index.records.iter_mut().filter(|r| !r.is_terminal()) {
            warn!(record_id = %record.id, status = %record.status, "Marking interrupted backup as failed");
            record.fail(FailureReason::Interrupted)?;
            interrupted += 1;
        }
        if interrupted > 0 {
            index.save()?;
        }

        debug!(records = index.records.len(), path = %index.path.display(), "Loaded record index");
        Ok(index)
    }

    /// Write the index atomically (temp file + rename).
    pub fn save(&self) -> anyhow::Result<()> {
        let mut records = self.records.clone();
        records.sort_by(|a, b| newest_first(b, a));
        let bytes = serde_json::to_vec_pretty(&IndexFile { records })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Insert or replace by id.
    pub fn upsert(&mut self, record: BackupRecord) {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn get(&self, id: &str) -> Option<&BackupRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut Vec<BackupRecord> {
        &mut self.records
    }

    /// Creation time of the newest completed archive.
    pub fn last_archive(&self) -> Option<DateTime<Utc>> {
        self.records
            .iter()
            .filter(|r| r.kind == BackupKind::Archive && r.status == BackupStatus::Completed)
            .map(|r| r.created_at)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BackupStatus;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_and_interrupted_recovery() {
        let dir = TempDir::new().unwrap();
        let mut index = RecordIndex::load(dir.path()).unwrap();
        assert!(index.records().is_empty());

        let mut done = BackupRecord::new(BackupKind::Archive, Utc::now(), None);
        for s in [
            BackupStatus::Quiescing,
            BackupStatus::Capturing,
            BackupStatus::CapturedLocal,
            BackupStatus::Uploading,
            BackupStatus::Completed,
        ] {
            done.advance(s).unwrap();
        }
        let mut in_flight = BackupRecord::new(BackupKind::Regular, Utc::now(), Some("42".into()));
        in_flight.advance(BackupStatus::Quiescing).unwrap();

        index.upsert(done.clone());
        index.upsert(in_flight.clone());
        index.save().unwrap();
        assert!(index.records().iter().any(|r| !r.is_terminal()));

        let reloaded = RecordIndex::load(dir.path()).unwrap();
        assert_eq!(reloaded.records().len(), 2);
        assert!(reloaded.records().iter().all(|r| r.is_terminal()));
        let recovered = reloaded.get(&in_flight.id).unwrap();
        assert_eq!(recovered.status, BackupStatus::Failed);
        assert_eq!(recovered.failure_reason, Some(FailureReason::Interrupted));
        assert_eq!(recovered.requested_by.as_deref(), Some("42"));
        assert_eq!(reloaded.last_archive(), Some(done.created_at));
        assert!(!dir.path().join("index.json.tmp").exists());
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let dir = TempDir::new().unwrap();
        let mut index = RecordIndex::load(dir.path()).unwrap();
        let mut record = BackupRecord::new(BackupKind::Regular, Utc::now(), None);
        index.upsert(record.clone());
        record.advance(BackupStatus::Quiescing).unwrap();
        index.upsert(record.clone());
        assert_eq!(index.records().len(), 1);
        assert_eq!(index.get(&record.id).unwrap().status, BackupStatus::Quiescing);
    }
}
