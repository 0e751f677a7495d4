//! Upload pipeline: pushes artifacts to remote storage with retry/backoff.

pub mod drive;
pub mod progress_stream;

pub use drive::DriveStore;

use crate::config::UploadConfig;
use crate::record::RemoteRef;
use crate::utils::errors::{StoreError, UploadError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// An object listed from a remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub remote_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload the file at `path` into `folder_id` as `name`; returns the remote id.
    async fn upload(&self, path: &Path, folder_id: &str, name: &str) -> Result<String, StoreError>;

    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteObject>, StoreError>;

    /// Delete by remote id. Deleting something already gone succeeds.
    async fn delete(&self, remote_id: &str) -> Result<(), StoreError>;

    /// Find the folder `name` under `parent_id`, creating it if needed.
    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            attempt_timeout: config.attempt_timeout,
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

pub struct Uploader {
    store: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn RemoteStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// Each attempt is bounded by the attempt timeout; a timeout counts as a
    /// transient failure. `on_attempt` sees the 1-based number of every
    /// attempt before it starts.
    pub async fn with_retry<T, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        mut on_attempt: impl FnMut(u32),
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            on_attempt(attempt);

            let result = match tokio::time::timeout(self.policy.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                warn!(op = label, attempt, error = %err, "Permanent remote failure");
                return Err(UploadError::Permanent {
                    attempts: attempt,
                    message: err.to_string(),
                });
            }
            if attempt >= self.policy.max_attempts {
                warn!(op = label, attempt, error = %err, "Retries exhausted");
                return Err(UploadError::Transient {
                    attempts: attempt,
                    message: err.to_string(),
                });
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                op = label,
                attempt,
                max_attempts = self.policy.max_attempts,
                retry_in = ?delay,
                error = %err,
                "Transient remote failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Upload one artifact into `folder_id`.
    pub async fn send(
        &self,
        path: &Path,
        folder_id: &str,
        name: &str,
        on_attempt: impl FnMut(u32),
    ) -> Result<RemoteRef, UploadError> {
        let store = &self.store;
        let remote_id = self
            .with_retry("upload", move || store.upload(path, folder_id, name), on_attempt)
            .await?;

        info!(name, remote_id = %remote_id, folder_id, "Upload complete");
        Ok(RemoteRef {
            remote_id,
            folder_id: folder_id.to_string(),
            name: name.to_string(),
        })
    }
}
