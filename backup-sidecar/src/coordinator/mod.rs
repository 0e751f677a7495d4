//! Consistency coordination: pause writes on the live server around a snapshot.

pub mod docker;
pub mod rcon;

pub use docker::DockerControl;
pub use rcon::RconControl;

use crate::config::ControlKind;
use crate::utils::errors::{ControlError, QuiesceError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Directives understood by the data source being backed up.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Persist pending writes and stop writing. Returns once acknowledged.
    async fn pause(&self) -> Result<(), ControlError>;

    /// Resume normal writes.
    async fn resume(&self) -> Result<(), ControlError>;

    async fn health_check(&self) -> Result<(), ControlError>;

    /// Undo a pause whose acknowledgment never arrived. Best effort.
    async fn cancel_pause(&self) {}
}

/// Channel for servers that need no quiescing.
pub struct NoopControl;

#[async_trait]
impl ControlChannel for NoopControl {
    fn name(&self) -> &str {
        "none"
    }

    async fn pause(&self) -> Result<(), ControlError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), ControlError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ControlError> {
        Ok(())
    }
}

pub fn channel_from_config(kind: &ControlKind) -> Arc<dyn ControlChannel> {
    match kind {
        ControlKind::Rcon { address, password } => Arc::new(RconControl::new(
            address.clone(),
            password.expose().to_string(),
        )),
        ControlKind::Docker {
            container,
            pause,
            resume,
        } => Arc::new(DockerControl::new(
            container.clone(),
            pause.clone(),
            resume.clone(),
        )),
        ControlKind::None => Arc::new(NoopControl),
    }
}

pub struct Coordinator {
    channel: Arc<dyn ControlChannel>,
    timeout: Duration,
}

impl Coordinator {
    pub fn new(channel: Arc<dyn ControlChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    /// Pause writes, bounded by the configured acknowledgment timeout.
    ///
    /// On success the returned guard must be resumed; if it is dropped
    /// without [`QuiesceGuard::resume`] a resume is spawned.
    pub async fn quiesce(&self) -> Result<QuiesceGuard, QuiesceError> {
        debug!(channel = self.channel.name(), "Quiescing data source");
        match tokio::time::timeout(self.timeout, self.channel.pause()).await {
            Ok(Ok(())) => {
                info!(channel = self.channel.name(), "Data source quiesced");
                Ok(QuiesceGuard {
                    channel: Some(self.channel.clone()),
                })
            }
            Ok(Err(e)) => Err(QuiesceError::Channel(e)),
            Err(_) => {
                warn!(
                    channel = self.channel.name(),
                    timeout = ?self.timeout,
                    "Quiesce not acknowledged in time"
                );
                let channel = self.channel.clone();
                tokio::spawn(async move { channel.cancel_pause().await });
                Err(QuiesceError::Timeout(self.timeout))
            }
        }
    }
}

/// Held for the duration of the quiesced window.
pub struct QuiesceGuard {
    channel: Option<Arc<dyn ControlChannel>>,
}

impl QuiesceGuard {
    pub async fn resume(mut self) -> Result<(), ControlError> {
        match self.channel.take() {
            Some(channel) => {
                channel.resume().await?;
                info!(channel = channel.name(), "Data source resumed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        warn!(channel = channel.name(), "Quiesce guard dropped without resume; resuming");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.resume().await {
                        warn!(error = %e, "Deferred resume failed");
                    }
                });
            }
            Err(_) => warn!("No runtime available for deferred resume"),
        }
    }
}
