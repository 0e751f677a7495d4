//! In-memory fakes for the engine's collaborators.

use crate::coordinator::ControlChannel;
use crate::notify::{Event, EventKind, Notifier};
use crate::upload::{RemoteObject, RemoteStore};
use crate::utils::errors::{ControlError, NotificationError, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};

/// Control channel that counts directives.
pub struct FakeControl {
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    cancels: AtomicUsize,
    pause_delay: Option<Duration>,
    fail_pause: bool,
    gate: Option<Semaphore>,
    entered: Notify,
}

impl FakeControl {
    pub fn new() -> Self {
        Self {
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            pause_delay: None,
            fail_pause: false,
            gate: None,
            entered: Notify::new(),
        }
    }

    pub fn with_pause_delay(mut self, delay: Duration) -> Self {
        self.pause_delay = Some(delay);
        self
    }

    pub fn failing_pause(mut self) -> Self {
        self.fail_pause = true;
        self
    }

    /// Hold every pause until [`FakeControl::release`].
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub async fn wait_for_pause(&self) {
        self.entered.notified().await;
    }

    /// Acknowledged pauses.
    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlChannel for FakeControl {
    fn name(&self) -> &str {
        "fake"
    }

    async fn pause(&self) -> Result<(), ControlError> {
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if let Some(delay) = self.pause_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_pause {
            return Err(ControlError::Rejected("save-off refused".into()));
        }
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), ControlError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ControlError> {
        Ok(())
    }

    async fn cancel_pause(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Remote store held in memory. Folder ids are `<parent>/<name>`.
pub struct MemoryStore {
    folders: Mutex<HashMap<String, Vec<RemoteObject>>>,
    upload_failures: Mutex<VecDeque<StoreError>>,
    upload_delay: Option<Duration>,
    upload_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            folders: Mutex::new(HashMap::new()),
            upload_failures: Mutex::new(VecDeque::new()),
            upload_delay: None,
            upload_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    /// Fail the next uploads with these errors, in order.
    pub fn fail_uploads(&self, errors: Vec<StoreError>) {
        self.upload_failures.lock().unwrap().extend(errors);
    }

    pub fn insert(&self, folder: &str, object: RemoteObject) {
        self.folders
            .lock()
            .unwrap()
            .entry(folder.to_string())
            .or_default()
            .push(object);
    }

    /// Object names in `folder`, sorted.
    pub fn names(&self, folder: &str) -> Vec<String> {
        let folders = self.folders.lock().unwrap();
        let mut names: Vec<String> = folders
            .get(folder)
            .map(|objects| objects.iter().map(|o| o.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn upload(&self, path: &Path, folder_id: &str, name: &str) -> Result<String, StoreError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.upload_failures.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        let size = std::fs::metadata(path)?.len();
        let id = format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.insert(
            folder_id,
            RemoteObject {
                remote_id: id.clone(),
                name: name.to_string(),
                created_at: Utc::now(),
                size,
            },
        );
        Ok(id)
    }

    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteObject>, StoreError> {
        Ok(self
            .folders
            .lock()
            .unwrap()
            .get(folder_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, remote_id: &str) -> Result<(), StoreError> {
        for objects in self.folders.lock().unwrap().values_mut() {
            objects.retain(|o| o.remote_id != remote_id);
        }
        Ok(())
    }

    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError> {
        let id = format!("{}/{}", parent_id, name);
        self.folders.lock().unwrap().entry(id.clone()).or_default();
        Ok(id)
    }
}

/// Notifier that keeps every event.
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
    count: watch::Sender<usize>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            count: watch::channel(0).0,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.event_kind).collect()
    }

    pub async fn wait_for(&self, kind: EventKind) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|_| self.kinds().contains(&kind)).await;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn emit(&self, event: &Event) -> Result<(), NotificationError> {
        self.events.lock().unwrap().push(event.clone());
        self.count.send_modify(|n| *n += 1);
        Ok(())
    }
}
