//! `docker exec` control channel, for servers driven through a console wrapper
//! inside their container (e.g. Bedrock `send-command save hold`).

use super::ControlChannel;
use crate::utils::errors::ControlError;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

pub struct DockerControl {
    container: String,
    pause: Vec<String>,
    resume: Vec<String>,
}

impl DockerControl {
    pub fn new(container: String, pause: Vec<String>, resume: Vec<String>) -> Self {
        Self {
            container,
            pause,
            resume,
        }
    }

    async fn docker(&self, args: &[String]) -> Result<String, ControlError> {
        debug!(container = %self.container, args = ?args, "docker");
        let output = Command::new("docker")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ControlError::Rejected(format!(
                "docker {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn exec(&self, command: &[String]) -> Result<(), ControlError> {
        let mut args = vec!["exec".to_string(), self.container.clone()];
        args.extend(command.iter().cloned());
        self.docker(&args).await.map(|_| ())
    }
}

#[async_trait]
impl ControlChannel for DockerControl {
    fn name(&self) -> &str {
        "docker"
    }

    async fn pause(&self) -> Result<(), ControlError> {
        self.exec(&self.pause).await
    }

    async fn resume(&self) -> Result<(), ControlError> {
        self.exec(&self.resume).await
    }

    async fn health_check(&self) -> Result<(), ControlError> {
        let args = [
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            self.container.clone(),
        ];
        let running = self.docker(&args).await?;
        if running.trim() == "true" {
            Ok(())
        } else {
            Err(ControlError::Rejected(format!(
                "container {} is not running",
                self.container
            )))
        }
    }

    async fn cancel_pause(&self) {
        if let Err(e) = self.exec(&self.resume).await {
            warn!(container = %self.container, error = %e, "resume after quiesce timeout failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_container() -> DockerControl {
        DockerControl::new(
            format!("backup-sidecar-missing-{}", uuid::Uuid::new_v4()),
            vec!["send-command".into(), "save hold".into()],
            vec!["send-command".into(), "save resume".into()],
        )
    }

    #[tokio::test]
    async fn test_failed_resume_surfaces_error() {
        let control = missing_container();
        // Fails whether docker is absent or the container is unknown.
        assert!(control.resume().await.is_err());
        assert!(control.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_pause_tolerates_failure() {
        missing_container().cancel_pause().await;
    }
}
