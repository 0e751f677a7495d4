//! Discord delivery: webhook embeds and bot channel messages.

use super::{Event, EventKind, Notifier};
use crate::config::Secret;
use crate::gateway::discord::DiscordRest;
use crate::utils::errors::NotificationError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const EMBED_TITLE: &str = "Backup Server Process";

fn color(kind: EventKind) -> u32 {
    match kind {
        EventKind::Completed | EventKind::Online => 0x2ecc71,
        EventKind::Started => 0x3498db,
        EventKind::Busy => 0xf1c40f,
        EventKind::Failed | EventKind::Forbidden => 0xe74c3c,
    }
}

/// Webhook body with a single embed describing `event`.
pub fn embed_payload(event: &Event) -> Value {
    let mut fields = Vec::new();
    if let Some(id) = &event.record_id {
        fields.push(json!({ "name": "Record", "value": id, "inline": true }));
    }
    if let Some(kind) = event.kind {
        fields.push(json!({ "name": "Kind", "value": kind.to_string(), "inline": true }));
    }
    if let Some(status) = event.status {
        fields.push(json!({ "name": "Status", "value": status.to_string(), "inline": true }));
    }

    json!({
        "embeds": [{
            "title": EMBED_TITLE,
            "description": event.summary(),
            "color": color(event.event_kind),
            "timestamp": event.timestamp.to_rfc3339(),
            "fields": fields,
        }]
    })
}

pub struct WebhookNotifier {
    client: Client,
    url: Secret,
}

impl WebhookNotifier {
    pub fn new(url: Secret) -> Result<Self, NotificationError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn emit(&self, event: &Event) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.url.expose())
            .json(&embed_payload(event))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Delivery(format!(
                "webhook returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Posts events as plain messages to a channel through the bot account.
pub struct ChannelNotifier {
    rest: DiscordRest,
    channel_id: String,
}

impl ChannelNotifier {
    pub fn new(rest: DiscordRest, channel_id: String) -> Self {
        Self { rest, channel_id }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn emit(&self, event: &Event) -> Result<(), NotificationError> {
        let content = format!("**{}**\n{}", EMBED_TITLE, event.summary());
        self.rest.send_message(&self.channel_id, &content).await?;
        Ok(())
    }
}
