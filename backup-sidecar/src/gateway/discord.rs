//! Discord bot transport.
//!
//! Keeps a gateway websocket open (Hello, Identify, heartbeats), turns
//! prefixed `MESSAGE_CREATE` events into [`InboundCommand`]s and answers
//! through the REST channel-message endpoint. Reconnects with exponential
//! backoff until shutdown.

use super::{CommandGateway, InboundCommand, Reply};
use crate::config::Secret;
use crate::utils::errors::{EngineError, NotificationError};
use anyhow::{anyhow, Context};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const API_BASE: &str = "https://discord.com/api/v10";
/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);
const MAX_MESSAGE_LEN: usize = 2000;

mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// Minimal Discord REST client for channel messages.
#[derive(Clone)]
pub struct DiscordRest {
    client: Client,
    token: Secret,
}

impl DiscordRest {
    pub fn new(token: Secret) -> Result<Self, NotificationError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { client, token })
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.token.expose())
    }

    /// Post a message; returns its id.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<String, NotificationError> {
        let url = format!("{}/channels/{}/messages", API_BASE, channel_id);
        let response = self
            .client
            .post(url)
            .header("Authorization", self.authorization())
            .json(&json!({ "content": truncate(content, MAX_MESSAGE_LEN) }))
            .send()
            .await?;
        let message: Value = checked(response).await?.json().await?;
        message["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| NotificationError::Delivery("message id missing from response".into()))
    }

    pub async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), NotificationError> {
        let url = format!("{}/channels/{}/messages/{}", API_BASE, channel_id, message_id);
        let response = self
            .client
            .patch(url)
            .header("Authorization", self.authorization())
            .json(&json!({ "content": truncate(content, MAX_MESSAGE_LEN) }))
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, NotificationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotificationError::Delivery(format!("discord returned {}: {}", status, body)))
}

fn truncate(content: &str, max: usize) -> &str {
    if content.len() <= max {
        return content;
    }
    let mut end = max;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

/// Command name from a message, if it carries `prefix`.
pub fn parse_command(content: &str, prefix: &str) -> Option<String> {
    let rest = content.trim_start().strip_prefix(prefix)?;
    let name = rest.split_whitespace().next()?;
    Some(name.to_string())
}

/// Build an inbound command from a `MESSAGE_CREATE` payload.
///
/// Only role ids are reported. Names are chosen by guild owners and are not
/// unique across guilds, so they never take part in authorization.
fn inbound_from_message(d: &Value, prefix: &str) -> Option<(String, InboundCommand)> {
    if d["author"]["bot"].as_bool().unwrap_or(false) {
        return None;
    }
    let command = parse_command(d["content"].as_str()?, prefix)?;
    let channel_id = d["channel_id"].as_str()?.to_string();
    let requester_id = d["author"]["id"].as_str()?.to_string();

    let requester_roles = d["member"]["roles"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    Some((
        channel_id,
        InboundCommand {
            command,
            requester_id,
            requester_roles,
        },
    ))
}

fn rejection_text(err: &EngineError) -> String {
    match err {
        EngineError::Forbidden => "You are not authorized to use this command.".to_string(),
        EngineError::Busy => "A backup is already running, try again later.".to_string(),
        EngineError::Aborted(msg) => format!("The backup job was aborted: {}", msg),
    }
}

pub struct DiscordGateway {
    token: Secret,
    prefix: String,
    commands: Arc<CommandGateway>,
    rest: DiscordRest,
    shutdown: CancellationToken,
}

impl DiscordGateway {
    pub fn new(
        token: Secret,
        prefix: String,
        commands: Arc<CommandGateway>,
        rest: DiscordRest,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            token,
            prefix,
            commands,
            rest,
            shutdown,
        }
    }

    /// Connect and serve commands, reconnecting until shutdown.
    pub async fn run(&self) {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);

        loop {
            if self.shutdown.is_cancelled() {
                info!("Discord gateway shutting down");
                return;
            }

            match self.connect_and_run().await {
                Ok(()) => {
                    info!("Discord gateway connection closed");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => warn!(error = %e, "Discord gateway connection error"),
            }

            if self.shutdown.is_cancelled() {
                return;
            }

            info!(retry_in = ?backoff, "Reconnecting to Discord gateway");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return,
            }
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn connect_and_run(&self) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(GATEWAY_URL)
            .await
            .context("connecting to Discord gateway")?;
        let (mut write, mut read) = ws_stream.split();

        let hello = match read.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str::<GatewayPayload>(&text)?,
            Some(Ok(other)) => return Err(anyhow!("expected Hello, got {:?}", other)),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(anyhow!("gateway closed before Hello")),
        };
        if hello.op != op::HELLO {
            return Err(anyhow!("expected Hello, got op {}", hello.op));
        }
        let heartbeat_ms = hello.d["heartbeat_interval"]
            .as_u64()
            .ok_or_else(|| anyhow!("Hello without heartbeat_interval"))?;

        let identify = json!({
            "op": op::IDENTIFY,
            "d": {
                "token": self.token.expose(),
                "intents": INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "backup-sidecar",
                    "device": "backup-sidecar",
                },
            },
        });
        write.send(Message::Text(identify.to_string())).await?;

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms));
        heartbeat.tick().await;
        let mut sequence: Option<u64> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = json!({ "op": op::HEARTBEAT, "d": sequence });
                    write.send(Message::Text(beat.to_string())).await?;
                }

                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(frame = ?frame, "Discord closed the gateway connection");
                            return Ok(());
                        }
                        None => return Ok(()),
                        Some(Err(e)) => {
                            error!(error = %e, "Gateway read error");
                            return Err(e.into());
                        }
                        Some(Ok(_)) => continue,
                    };

                    let payload: GatewayPayload = match serde_json::from_str(&text) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "Unparseable gateway payload");
                            continue;
                        }
                    };
                    if payload.s.is_some() {
                        sequence = payload.s;
                    }

                    match payload.op {
                        op::DISPATCH => self.on_dispatch(payload.t.as_deref(), &payload.d),
                        op::HEARTBEAT => {
                            let beat = json!({ "op": op::HEARTBEAT, "d": sequence });
                            write.send(Message::Text(beat.to_string())).await?;
                        }
                        op::RECONNECT => {
                            info!("Gateway requested reconnect");
                            return Ok(());
                        }
                        op::INVALID_SESSION => {
                            warn!("Gateway session invalidated");
                            return Ok(());
                        }
                        op::HEARTBEAT_ACK => debug!("Heartbeat acknowledged"),
                        other => debug!(op = other, "Ignoring gateway op"),
                    }
                }

                _ = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    fn on_dispatch(&self, event: Option<&str>, d: &Value) {
        match event {
            Some("READY") => {
                let user = d["user"]["username"].as_str().unwrap_or("unknown");
                info!(user, "Discord gateway ready");
            }
            Some("MESSAGE_CREATE") => {
                if let Some((channel_id, inbound)) = inbound_from_message(d, &self.prefix) {
                    self.spawn_command(channel_id, inbound);
                }
            }
            _ => {}
        }
    }

    fn spawn_command(&self, channel_id: String, inbound: InboundCommand) {
        let commands = self.commands.clone();
        let rest = self.rest.clone();
        tokio::spawn(async move {
            let result = commands.handle(&inbound).await;
            let delivered = match result {
                Ok(Reply::Text(text)) => rest.send_message(&channel_id, &text).await.map(|_| ()),
                Ok(Reply::Pong) => {
                    let sent_at = Instant::now();
                    match rest.send_message(&channel_id, "Pong!").await {
                        Ok(message_id) => {
                            let latency = sent_at.elapsed().as_millis();
                            rest.edit_message(&channel_id, &message_id, &format!("Pong! {} ms", latency))
                                .await
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => rest.send_message(&channel_id, &rejection_text(&e)).await.map(|_| ()),
            };
            if let Err(e) = delivered {
                warn!(command = %inbound.command, error = %e, "Failed to reply to command");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("!trigger", "!"), Some("trigger".to_string()));
        assert_eq!(parse_command("  !status now", "!"), Some("status".to_string()));
        assert_eq!(parse_command("! ping", "!"), Some("ping".to_string()));
        assert_eq!(parse_command("hello !trigger", "!"), None);
        assert_eq!(parse_command("!", "!"), None);
        assert_eq!(parse_command("?backups", "?"), Some("backups".to_string()));
    }

    #[test]
    fn test_inbound_from_message_reports_role_ids() {
        let d = json!({
            "channel_id": "55",
            "content": "!backup-now please",
            "author": { "id": "1234", "bot": false },
            "member": { "roles": ["900", "777"] },
        });
        let (channel, inbound) = inbound_from_message(&d, "!").unwrap();
        assert_eq!(channel, "55");
        assert_eq!(inbound.command, "backup-now");
        assert_eq!(inbound.requester_id, "1234");
        assert_eq!(inbound.requester_roles, vec!["900", "777"]);
    }

    #[test]
    fn test_role_named_like_authorized_id_grants_nothing() {
        // Role "555" may be called "admin" in a foreign guild; only its id counts.
        let d = json!({
            "channel_id": "55",
            "content": "!backup-now",
            "author": { "id": "66" },
            "member": { "roles": ["555"] },
            "guild_id": "other-guild",
        });
        let (_, inbound) = inbound_from_message(&d, "!").unwrap();
        assert_eq!(inbound.requester_roles, vec!["555"]);
        assert!(!inbound.requester_roles.iter().any(|r| r == "admin" || r == "900"));
    }

    #[test]
    fn test_bot_and_unprefixed_messages_ignored() {
        let bot = json!({
            "channel_id": "55",
            "content": "!trigger",
            "author": { "id": "1", "bot": true },
        });
        assert!(inbound_from_message(&bot, "!").is_none());

        let chatter = json!({
            "channel_id": "55",
            "content": "nice base",
            "author": { "id": "2" },
        });
        assert!(inbound_from_message(&chatter, "!").is_none());

        let dm = json!({
            "channel_id": "56",
            "content": "!trigger",
            "author": { "id": "3" },
        });
        let (_, inbound) = inbound_from_message(&dm, "!").unwrap();
        assert!(inbound.requester_roles.is_empty());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate(&"x".repeat(2100), MAX_MESSAGE_LEN).len(), MAX_MESSAGE_LEN);
    }
}
