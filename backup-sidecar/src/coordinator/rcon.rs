//! Minecraft Java RCON control channel.
//!
//! All commands share one authenticated connection behind an async mutex, so
//! they reach the server in the order they were issued. A command abandoned
//! by its caller still holds the connection until the server answers, which
//! keeps a later `save-on` from overtaking an in-flight `save-off`.

use super::ControlChannel;
use crate::utils::errors::ControlError;
use async_trait::async_trait;
use minecraft_client_rs::Client;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

const FLUSH_ACK: &str = "Saved the game";

pub struct RconControl {
    address: String,
    password: String,
    conn: Arc<Mutex<Option<Client>>>,
}

impl RconControl {
    pub fn new(address: String, password: String) -> Self {
        Self {
            address,
            password,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Run one command and return the response body.
    pub async fn execute(&self, command: &str) -> Result<String, ControlError> {
        let mut slot = self.conn.clone().lock_owned().await;
        let address = self.address.clone();
        let password = self.password.clone();
        let command = command.to_string();

        spawn_blocking(move || run_command(&mut slot, &address, &password, &command))
            .await
            .map_err(|e| ControlError::Rcon(format!("RCON task failed: {}", e)))?
    }
}

/// Send on the cached connection, reconnecting once if it went stale.
fn run_command(
    slot: &mut Option<Client>,
    address: &str,
    password: &str,
    command: &str,
) -> Result<String, ControlError> {
    let reused = slot.is_some();
    match send_on(slot, address, password, command) {
        Err(e) if reused => {
            debug!(error = %e, "RCON connection went stale, reconnecting");
            send_on(slot, address, password, command)
        }
        other => other,
    }
}

fn send_on(
    slot: &mut Option<Client>,
    address: &str,
    password: &str,
    command: &str,
) -> Result<String, ControlError> {
    if slot.is_none() {
        let mut client = Client::new(address.to_string()).map_err(rcon_error)?;
        client.authenticate(password.to_string()).map_err(rcon_error)?;
        *slot = Some(client);
    }
    let client = slot
        .as_mut()
        .ok_or_else(|| ControlError::Rcon("RCON connection unavailable".into()))?;

    match client.send_command(command.to_string()) {
        Ok(response) => Ok(response.body),
        Err(e) => {
            let err = rcon_error(e);
            if let Some(mut stale) = slot.take() {
                let _ = stale.close();
            }
            Err(err)
        }
    }
}

fn rcon_error<E: std::fmt::Display>(err: E) -> ControlError {
    ControlError::Rcon(err.to_string())
}

#[async_trait]
impl ControlChannel for RconControl {
    fn name(&self) -> &str {
        "rcon"
    }

    async fn pause(&self) -> Result<(), ControlError> {
        self.execute("save-off").await?;
        let flush = self.execute("save-all flush").await;
        match flush {
            Ok(body) if body.contains(FLUSH_ACK) => {
                debug!(response = %body.trim(), "save-all flush acknowledged");
                Ok(())
            }
            other => {
                if let Err(e) = self.execute("save-on").await {
                    warn!(error = %e, "save-on after failed flush also failed");
                }
                match other {
                    Ok(body) => Err(ControlError::Rejected(format!(
                        "unexpected save-all response: {}",
                        body.trim()
                    ))),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn resume(&self) -> Result<(), ControlError> {
        self.execute("save-on").await.map(|_| ())
    }

    async fn health_check(&self) -> Result<(), ControlError> {
        self.execute("list").await.map(|_| ())
    }

    async fn cancel_pause(&self) {
        if let Err(e) = self.execute("save-on").await {
            warn!(error = %e, "save-on after quiesce timeout failed");
        }
    }
}
