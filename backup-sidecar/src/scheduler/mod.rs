//! Scheduler: timers, the single active-job slot and the backup pipeline.
//!
//! Every job, timer-driven or manual, acquires the one permit of
//! `job_slot` with `try_acquire_owned`; a tick that finds it taken is
//! skipped. The permit lives in the job task and is released when the task
//! ends, whatever path it takes.

pub mod interval;

use crate::coordinator::Coordinator;
use crate::notify::{announce, record_detail, Event, EventKind, Notifier};
use crate::record::{BackupKind, BackupRecord, BackupStatus, FailureReason, RecordIndex};
use crate::retention::{self, RemoteFolders, RetentionPolicy};
use crate::snapshot::{self, SnapshotEngine};
use crate::upload::Uploader;
use crate::utils::errors::{EngineError, QuiesceError, UploadError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcomes kept for health evaluation.
pub const RECENT_OUTCOMES: usize = 32;

/// Static inputs of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub data_dir: PathBuf,
    pub artifact_prefix: String,
    pub interval: Duration,
    pub archive_check: Duration,
    /// Remote folder holding the `Retention` and `Archive` sub-folders
    pub remote_root: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    pub record_id: String,
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub record_id: String,
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub failure: Option<FailureReason>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    fn from_record(record: &BackupRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            kind: record.kind,
            status: record.status,
            failure: record.failure_reason.clone(),
            finished_at: record.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Read-only view of the engine for health reporting.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub started_at: DateTime<Utc>,
    pub last_regular_run: Option<DateTime<Utc>>,
    pub last_archive_run: Option<DateTime<Utc>>,
    pub active_job: Option<ActiveJob>,
    pub last_finished: Option<JobOutcome>,
    /// Oldest first
    pub recent: VecDeque<JobOutcome>,
}

impl EngineStatus {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            last_regular_run: None,
            last_archive_run: None,
            active_job: None,
            last_finished: None,
            recent: VecDeque::new(),
        }
    }

    fn recover(index: &RecordIndex, started_at: DateTime<Utc>) -> Self {
        let mut status = Self::new(started_at);
        status.last_archive_run = index.last_archive();
        status.last_regular_run = index
            .records()
            .iter()
            .filter(|r| r.kind == BackupKind::Regular)
            .map(|r| r.created_at)
            .max();
        status
    }

    pub fn record_outcome(&mut self, outcome: JobOutcome) {
        if self.recent.len() == RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.recent.push_back(outcome.clone());
        self.last_finished = Some(outcome);
    }
}

pub struct Scheduler {
    settings: SchedulerSettings,
    policy: RetentionPolicy,
    coordinator: Coordinator,
    snapshot: SnapshotEngine,
    uploader: Uploader,
    notifier: Arc<dyn Notifier>,
    folders: OnceCell<RemoteFolders>,
    job_slot: Arc<Semaphore>,
    index: Mutex<RecordIndex>,
    status: Arc<RwLock<EngineStatus>>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        policy: RetentionPolicy,
        coordinator: Coordinator,
        snapshot: SnapshotEngine,
        uploader: Uploader,
        notifier: Arc<dyn Notifier>,
        index: RecordIndex,
    ) -> Self {
        let status = EngineStatus::recover(&index, Utc::now());
        Self {
            settings,
            policy,
            coordinator,
            snapshot,
            uploader,
            notifier,
            folders: OnceCell::new(),
            job_slot: Arc::new(Semaphore::new(1)),
            index: Mutex::new(index),
            status: Arc::new(RwLock::new(status)),
        }
    }

    pub fn status_handle(&self) -> Arc<RwLock<EngineStatus>> {
        self.status.clone()
    }

    /// Point-in-time copy of the engine status.
    pub async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }

    /// All indexed records, newest first.
    pub async fn records(&self) -> Vec<BackupRecord> {
        let mut records = self.index.lock().await.records().to_vec();
        records.sort_by(crate::record::newest_first);
        records
    }

    /// One-time housekeeping before the timers start.
    pub async fn startup(&self) {
        self.prune_local().await;
        announce(
            self.notifier.as_ref(),
            Event::new(EventKind::Online).with_detail(format!(
                "every {:?}, keeping {} backups, archive every {} day(s)",
                self.settings.interval,
                self.policy.keep_count,
                self.policy.archive_every.num_days()
            )),
        )
        .await;
    }

    /// Drive the regular and archive timers until `shutdown` fires, then
    /// wait up to `grace` for an active job.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, grace: Duration) {
        let start = Instant::now();
        let mut regular = interval_at(start + self.settings.interval, self.settings.interval);
        regular.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut archive = interval_at(
            start + self.settings.archive_check,
            self.settings.archive_check,
        );
        archive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval = ?self.settings.interval,
            archive_check = ?self.settings.archive_check,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = regular.tick() => {
                    self.clone().dispatch("regular timer");
                }
                _ = archive.tick() => {
                    if self.archive_due(Utc::now()).await {
                        self.clone().dispatch("archive timer");
                    } else {
                        debug!("Archive not due");
                    }
                }
            }
        }

        info!("Scheduler stopping");
        match tokio::time::timeout(grace, self.job_slot.acquire()).await {
            Ok(_) => info!("No backup in flight"),
            Err(_) => warn!(grace = ?grace, "Backup still running at shutdown"),
        }
    }

    /// Start a job unless one is active. Returns the job handle if started.
    pub fn dispatch(self: Arc<Self>, trigger: &str) -> Option<tokio::task::JoinHandle<BackupRecord>> {
        match self.job_slot.clone().try_acquire_owned() {
            Ok(permit) => {
                debug!(trigger, "Dispatching backup");
                Some(tokio::spawn(async move { self.execute(permit, None).await }))
            }
            Err(_) => {
                info!(trigger, "Backup already running, skipping tick");
                None
            }
        }
    }

    /// Run a job now on behalf of `requested_by` and wait for its terminal record.
    pub async fn trigger_manual(
        self: &Arc<Self>,
        requested_by: Option<String>,
    ) -> Result<BackupRecord, EngineError> {
        let permit = self
            .job_slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::Busy)?;
        let this = self.clone();
        tokio::spawn(async move { this.execute(permit, requested_by).await })
            .await
            .map_err(|e| EngineError::Aborted(e.to_string()))
    }

    async fn archive_due(&self, now: DateTime<Utc>) -> bool {
        let last = self.status.read().await.last_archive_run;
        self.policy.archive_due(last, now)
    }

    async fn execute(
        self: Arc<Self>,
        _permit: OwnedSemaphorePermit,
        requested_by: Option<String>,
    ) -> BackupRecord {
        let now = Utc::now();
        let kind = if self.archive_due(now).await {
            BackupKind::Archive
        } else {
            BackupKind::Regular
        };
        let record = BackupRecord::new(kind, now, requested_by);
        info!(record_id = %record.id, kind = %kind, requested_by = ?record.requested_by, "Backup started");

        {
            let mut status = self.status.write().await;
            if kind == BackupKind::Regular {
                status.last_regular_run = Some(now);
            }
            status.active_job = Some(ActiveJob {
                record_id: record.id.clone(),
                kind,
                status: record.status,
                started_at: now,
            });
        }
        self.persist(&record).await;

        let mut started = Event::for_record(EventKind::Started, &record);
        if let Some(who) = &record.requested_by {
            started = started.with_detail(format!("requested by {}", who));
        }
        announce(self.notifier.as_ref(), started).await;

        let record = self.pipeline(record).await;

        self.prune_local().await;
        if record.status == BackupStatus::Completed {
            self.prune_remote().await;
        }
        let record = self.current(record).await;

        {
            let mut status = self.status.write().await;
            status.active_job = None;
            status.record_outcome(JobOutcome::from_record(&record));
            if record.kind == BackupKind::Archive && record.status == BackupStatus::Completed {
                status.last_archive_run = Some(record.created_at);
            }
        }

        let event_kind = match record.status {
            BackupStatus::Completed => EventKind::Completed,
            _ => EventKind::Failed,
        };
        announce(
            self.notifier.as_ref(),
            Event::for_record(event_kind, &record).with_detail(record_detail(&record)),
        )
        .await;
        record
    }

    async fn pipeline(&self, mut record: BackupRecord) -> BackupRecord {
        self.transition(&mut record, BackupStatus::Quiescing).await;
        let guard = match self.coordinator.quiesce().await {
            Ok(guard) => guard,
            Err(QuiesceError::Timeout(_)) => {
                return self.fail(record, FailureReason::QuiesceTimeout).await;
            }
            Err(e) => return self.fail(record, FailureReason::Quiesce(e.to_string())).await,
        };

        self.transition(&mut record, BackupStatus::Capturing).await;
        let captured = self.snapshot.capture(&record, &self.settings.data_dir).await;
        if let Err(e) = guard.resume().await {
            warn!(record_id = %record.id, error = %e, "Resume after capture failed");
        }
        let artifact = match captured {
            Ok(artifact) => artifact,
            Err(e) => return self.fail(record, FailureReason::Capture(e.to_string())).await,
        };

        record.local_path = Some(artifact.path.clone());
        record.size_bytes = artifact.size_bytes;
        record.checksum = Some(artifact.checksum.clone());
        self.transition(&mut record, BackupStatus::CapturedLocal).await;
        self.prune_local().await;

        let path = artifact.path.clone();
        match tokio::task::spawn_blocking(move || snapshot::verify(&path)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return self
                    .fail(record, FailureReason::Capture("checksum mismatch".to_string()))
                    .await;
            }
            Ok(Err(e)) => return self.fail(record, FailureReason::Capture(e.to_string())).await,
            Err(e) => return self.fail(record, FailureReason::Capture(e.to_string())).await,
        }

        self.transition(&mut record, BackupStatus::Uploading).await;
        let folders = match self.folders().await {
            Ok(folders) => folders,
            Err(e) => return self.fail(record, upload_failure(&e)).await,
        };
        let folder = folders.for_kind(record.kind).to_string();
        let name = record.artifact_name(&self.settings.artifact_prefix);

        let mut attempts = 0;
        let sent = self
            .uploader
            .send(&artifact.path, &folder, &name, |n| attempts = n)
            .await;
        record.upload_attempts = attempts;

        match sent {
            Ok(remote) => {
                record.remote_path = Some(remote);
                self.transition(&mut record, BackupStatus::Completed).await;
                record
            }
            Err(e) => self.fail(record, upload_failure(&e)).await,
        }
    }

    async fn transition(&self, record: &mut BackupRecord, to: BackupStatus) {
        if let Err(e) = record.advance(to) {
            error!(record_id = %record.id, error = %e, "Rejected status transition");
            return;
        }
        debug!(record_id = %record.id, status = %to, "Backup status");
        if let Some(active) = self.status.write().await.active_job.as_mut() {
            active.status = to;
        }
        self.persist(record).await;
    }

    async fn fail(&self, mut record: BackupRecord, reason: FailureReason) -> BackupRecord {
        warn!(record_id = %record.id, reason = %reason, "Backup failed");
        if let Err(e) = record.fail(reason) {
            error!(record_id = %record.id, error = %e, "Rejected failure transition");
        }
        self.persist(&record).await;
        record
    }

    async fn persist(&self, record: &BackupRecord) {
        let mut index = self.index.lock().await;
        index.upsert(record.clone());
        if let Err(e) = index.save() {
            error!(record_id = %record.id, error = %e, "Failed to persist record index");
        }
    }

    /// Latest copy of `record` from the index; retention may have changed it.
    async fn current(&self, record: BackupRecord) -> BackupRecord {
        let index = self.index.lock().await;
        index.get(&record.id).cloned().unwrap_or(record)
    }

    async fn folders(&self) -> Result<RemoteFolders, UploadError> {
        self.folders
            .get_or_try_init(|| async {
                let store = self.uploader.store();
                let root = self.settings.remote_root.as_str();
                let retention = self
                    .uploader
                    .with_retry(
                        "ensure_folder",
                        || store.ensure_folder(root, RemoteFolders::RETENTION),
                        |_| {},
                    )
                    .await?;
                let archive = self
                    .uploader
                    .with_retry(
                        "ensure_folder",
                        || store.ensure_folder(root, RemoteFolders::ARCHIVE),
                        |_| {},
                    )
                    .await?;
                info!(retention = %retention, archive = %archive, "Resolved remote folders");
                Ok::<_, UploadError>(RemoteFolders { retention, archive })
            })
            .await
            .cloned()
    }

    async fn prune_local(&self) {
        let mut index = self.index.lock().await;
        let report = retention::prune_local(index.records_mut(), &self.policy);
        if report.removed.is_empty() {
            return;
        }
        if let Err(e) = index.save() {
            error!(error = %e, "Failed to persist record index after local prune");
        }
    }

    async fn prune_remote(&self) {
        let folders = match self.folders().await {
            Ok(folders) => folders,
            Err(e) => {
                warn!(error = %e, "Skipping remote prune, folders unavailable");
                return;
            }
        };
        let report = match retention::prune_remote(
            self.uploader.store().as_ref(),
            &folders,
            &self.policy,
            &self.settings.artifact_prefix,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Remote prune failed");
                return;
            }
        };

        let mut index = self.index.lock().await;
        retention::apply_remote_report(index.records_mut(), &report);
        let dropped = retention::drop_orphans(index.records_mut(), self.policy.keep_count);
        if dropped > 0 {
            debug!(dropped, "Dropped records with no remaining copies");
        }
        if let Err(e) = index.save() {
            error!(error = %e, "Failed to persist record index after remote prune");
        }
    }
}

fn upload_failure(err: &UploadError) -> FailureReason {
    match err {
        UploadError::Transient { .. } => FailureReason::UploadExhausted,
        UploadError::Permanent { message, .. } => FailureReason::UploadRejected(message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveMode;
    use crate::test_support::{FakeControl, MemoryStore, RecordingNotifier};
    use crate::upload::RetryPolicy;
    use crate::utils::errors::StoreError;
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        scheduler: Arc<Scheduler>,
        control: Arc<FakeControl>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        staging: TempDir,
        _source: TempDir,
    }

    fn harness_with(control: FakeControl, store: MemoryStore, keep_count: usize) -> Harness {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("world")).unwrap();
        fs::write(source.path().join("world/level.dat"), vec![3u8; 2048]).unwrap();
        let staging = TempDir::new().unwrap();

        let control = Arc::new(control);
        let store = Arc::new(store);
        let notifier = Arc::new(RecordingNotifier::new());
        let index = RecordIndex::load(staging.path()).unwrap();

        let scheduler = Scheduler::new(
            SchedulerSettings {
                data_dir: source.path().to_path_buf(),
                artifact_prefix: "MineCraftBackup".into(),
                interval: Duration::from_secs(60),
                archive_check: Duration::from_secs(3600),
                remote_root: "root".into(),
            },
            RetentionPolicy {
                keep_count,
                archive_every: chrono::Duration::days(7),
                archive_mode: ArchiveMode::Replace,
            },
            Coordinator::new(control.clone(), Duration::from_secs(10)),
            SnapshotEngine::new(staging.path(), "MineCraftBackup", 3),
            Uploader::new(
                store.clone(),
                RetryPolicy {
                    max_attempts: 5,
                    initial_backoff: Duration::from_millis(10),
                    max_backoff: Duration::from_millis(40),
                    attempt_timeout: Duration::from_secs(60),
                },
            ),
            notifier.clone(),
            index,
        );

        Harness {
            scheduler: Arc::new(scheduler),
            control,
            store,
            notifier,
            staging,
            _source: source,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeControl::new(), MemoryStore::new(), 5)
    }

    #[tokio::test]
    async fn test_first_job_is_archive_and_leaves_no_local_copy() {
        let h = harness();
        let record = h.scheduler.trigger_manual(Some("42".into())).await.unwrap();

        assert_eq!(record.kind, BackupKind::Archive);
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.upload_attempts, 1);
        assert!(record.remote_path.is_some());
        assert!(record.local_path.is_none());
        assert_eq!(h.store.names("root/Archive").len(), 1);
        assert_eq!(h.control.pauses(), 1);
        assert_eq!(h.control.resumes(), 1);
        assert_eq!(
            h.notifier.kinds(),
            vec![EventKind::Started, EventKind::Completed]
        );

        let second = h.scheduler.trigger_manual(None).await.unwrap();
        assert_eq!(second.kind, BackupKind::Regular);
        assert!(second.local_path.as_ref().unwrap().exists());
        assert_eq!(h.store.names("root/Retention").len(), 1);
    }

    #[tokio::test]
    async fn test_quiesce_timeout_fails_without_artifact() {
        let h = harness_with(
            FakeControl::new().with_pause_delay(Duration::from_secs(3600)),
            MemoryStore::new(),
            5,
        );
        tokio::time::pause();
        let record = h.scheduler.trigger_manual(None).await.unwrap();

        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.failure_reason, Some(FailureReason::QuiesceTimeout));
        assert!(record.local_path.is_none());
        assert_eq!(h.control.resumes(), 0);
        assert_eq!(h.store.upload_calls(), 0);
        let artifacts = fs::read_dir(h.staging.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tar.zst"))
            .count();
        assert_eq!(artifacts, 0);
        assert_eq!(h.notifier.kinds().last(), Some(&EventKind::Failed));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let store = MemoryStore::new();
        store.fail_uploads(vec![
            StoreError::Status {
                status: 500,
                body: String::new(),
            },
            StoreError::Timeout,
        ]);
        let h = harness_with(FakeControl::new(), store, 5);

        let record = h.scheduler.trigger_manual(None).await.unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.upload_attempts, 3);
        assert!(record.remote_path.is_some());
        assert_eq!(h.control.resumes(), 1);
    }

    #[tokio::test]
    async fn test_permanent_rejection_keeps_artifact() {
        let h = harness();
        h.scheduler.trigger_manual(None).await.unwrap();
        h.store.fail_uploads(vec![StoreError::Status {
            status: 400,
            body: "bad metadata".into(),
        }]);

        let record = h.scheduler.trigger_manual(None).await.unwrap();
        assert_eq!(record.status, BackupStatus::Failed);
        assert!(matches!(
            record.failure_reason,
            Some(FailureReason::UploadRejected(_))
        ));
        assert_eq!(record.upload_attempts, 1);
        assert!(record.local_path.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_capture_failure_still_resumes() {
        let h = harness();
        fs::remove_dir_all(h.scheduler.settings.data_dir.clone()).unwrap();

        let record = h.scheduler.trigger_manual(None).await.unwrap();
        assert_eq!(record.status, BackupStatus::Failed);
        assert!(matches!(record.failure_reason, Some(FailureReason::Capture(_))));
        assert_eq!(h.control.pauses(), 1);
        assert_eq!(h.control.resumes(), 1);
    }

    #[tokio::test]
    async fn test_busy_while_job_active() {
        let h = harness_with(FakeControl::new().gated(), MemoryStore::new(), 5);

        let first = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.trigger_manual(None).await })
        };
        h.control.wait_for_pause().await;

        assert_eq!(h.scheduler.trigger_manual(None).await, Err(EngineError::Busy));
        assert!(h.scheduler.clone().dispatch("test").is_none());
        let active: Vec<_> = h
            .scheduler
            .records()
            .await
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect();
        assert_eq!(active.len(), 1);
        assert!(h.scheduler.status().await.active_job.is_some());

        h.control.release();
        let record = first.await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert!(h.scheduler.status_handle().read().await.active_job.is_none());

        let again = h.scheduler.trigger_manual(None).await.unwrap();
        assert_eq!(again.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn test_local_window_after_many_runs() {
        let h = harness_with(FakeControl::new(), MemoryStore::new(), 2);
        for _ in 0..5 {
            h.scheduler.trigger_manual(None).await.unwrap();
        }

        let records = h.scheduler.records().await;
        let local_regular = records
            .iter()
            .filter(|r| r.kind == BackupKind::Regular && r.local_path.is_some())
            .count();
        assert_eq!(local_regular, 2);
        assert_eq!(h.store.names("root/Retention").len(), 2);
        assert_eq!(h.store.names("root/Archive").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_dispatches_on_interval_and_stops() {
        let h = harness();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            h.scheduler
                .clone()
                .run(shutdown.clone(), Duration::from_secs(5)),
        );

        h.notifier.wait_for(EventKind::Completed).await;
        assert_eq!(h.store.names("root/Archive").len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
