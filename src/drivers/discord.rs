//! Discord driver.
//!
//! Receiving needs a bot token and runs a serenity gateway client. Sending
//! goes through a webhook (default when `webhook_url` is set, supports
//! per-message username and avatar) or through the bot itself.
//!
//! Config keys under `discord.<instance>`:
//! - `bot_token`: required for receiving and for bot sends
//! - `send_method`: `"webhook"` (default) or `"bot"`
//! - `webhook_url`: required for webhook sends
//! - `max_file_size`: per-attachment upload limit (default 8 MiB)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serenity::all::{
    ChannelId, CreateAttachment, CreateMessage, ExecuteWebhook, Message, Ready, Webhook,
};
use serenity::http::{Http, HttpBuilder};
use serenity::prelude::*;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::bridge::driver::{Driver, OutboundMessage};
use crate::bridge::formatter::{split_message, RichHeader};
use crate::bridge::orchestrator::Coordinator;
use crate::common::error::{ConfigError, SendError, SendResult};
use crate::common::{AttachmentKind, AttachmentRef, ChannelAddress, NormalizedMessage, SenderInfo};

pub const PLATFORM: &str = "discord";

/// Discord's per-message character cap.
pub const MAX_MESSAGE_LEN: usize = 2000;

/// Webhook upload limit for servers without boosts.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMethod {
    #[default]
    Webhook,
    Bot,
}

/// `discord.<instance>` section of `config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    pub bot_token: Option<String>,
    #[serde(default)]
    pub send_method: SendMethod,
    pub webhook_url: Option<String>,
    pub max_file_size: Option<u64>,
}

impl DiscordConfig {
    pub fn validate(&self, instance_id: &str) -> Result<(), ConfigError> {
        let has_token = self.bot_token.as_deref().is_some_and(|t| !t.is_empty());
        let has_webhook = self.webhook_url.as_deref().is_some_and(|u| !u.is_empty());
        if !has_token && !has_webhook {
            return Err(ConfigError::MissingField {
                field: format!("{}.{}.bot_token or webhook_url", PLATFORM, instance_id),
            });
        }
        if self.send_method == SendMethod::Bot && !has_token {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.{}.send_method", PLATFORM, instance_id),
                message: "\"bot\" requires bot_token".to_string(),
            });
        }
        Ok(())
    }

    fn uses_webhook(&self) -> bool {
        self.send_method == SendMethod::Webhook
            && self.webhook_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

pub struct DiscordDriver {
    instance_id: String,
    config: DiscordConfig,
    http: Arc<Http>,
    webhook: OnceCell<Webhook>,
}

impl DiscordDriver {
    pub fn new(instance_id: impl Into<String>, config: DiscordConfig) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let token = config.bot_token.clone().unwrap_or_default();
        let http = HttpBuilder::new(token).client(reqwest_client).build();

        Ok(Self {
            instance_id: instance_id.into(),
            config,
            http: Arc::new(http),
            webhook: OnceCell::new(),
        })
    }

    async fn webhook(&self) -> SendResult<&Webhook> {
        let url = self.config.webhook_url.as_deref().unwrap_or_default();
        self.webhook
            .get_or_try_init(|| async { Webhook::from_url(&*self.http, url).await })
            .await
            .map_err(SendError::from)
    }

    async fn send_webhook(
        &self,
        chunks: Vec<String>,
        files: Vec<CreateAttachment>,
        username: Option<&str>,
        avatar: Option<&str>,
    ) -> SendResult<()> {
        let webhook = self.webhook().await?;
        let last = chunks.len().saturating_sub(1);
        let mut files = Some(files);

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut builder = ExecuteWebhook::new();
            if !chunk.is_empty() {
                builder = builder.content(chunk);
            }
            if let Some(username) = username {
                builder = builder.username(username);
            }
            if let Some(avatar) = avatar {
                builder = builder.avatar_url(avatar);
            }
            if i == last {
                builder = builder.add_files(files.take().unwrap_or_default());
            }
            webhook.execute(&*self.http, false, builder).await?;
        }
        Ok(())
    }

    async fn send_bot(
        &self,
        address: &ChannelAddress,
        chunks: Vec<String>,
        files: Vec<CreateAttachment>,
    ) -> SendResult<()> {
        let channel_id = address
            .get("channel_id")
            .and_then(|id| id.parse::<u64>().ok())
            .filter(|id| *id != 0)
            .ok_or_else(|| SendError::InvalidAddress {
                message: format!("missing or invalid channel_id in {}", address),
            })?;
        let channel = ChannelId::new(channel_id);
        let last = chunks.len().saturating_sub(1);
        let mut files = Some(files);

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut builder = CreateMessage::new();
            if !chunk.is_empty() {
                builder = builder.content(chunk);
            }
            if i == last {
                builder = builder.add_files(files.take().unwrap_or_default());
            }
            channel.send_message(&*self.http, builder).await?;
        }
        Ok(())
    }
}

/// Bold title, italic content, on its own line above the text.
fn header_line(header: &RichHeader) -> String {
    match (header.title.is_empty(), header.content.is_empty()) {
        (false, false) => format!("**{}** · *{}*", header.title, header.content),
        (false, true) => format!("**{}**", header.title),
        (true, false) => format!("*{}*", header.content),
        (true, true) => String::new(),
    }
}

fn compose_text(message: &OutboundMessage) -> String {
    let header = message
        .rich_header
        .as_ref()
        .map(header_line)
        .unwrap_or_default();
    match (header.is_empty(), message.text.is_empty()) {
        (true, _) => message.text.clone(),
        (false, true) => header,
        (false, false) => format!("{}\n{}", header, message.text),
    }
}

#[async_trait]
impl Driver for DiscordDriver {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn max_file_size(&self) -> u64 {
        self.config.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE)
    }

    fn supports_rich_header(&self) -> bool {
        true
    }

    async fn send(&self, address: &ChannelAddress, message: OutboundMessage) -> SendResult<()> {
        let text = compose_text(&message);
        let chunks = if text.is_empty() {
            // Attachment-only message
            vec![String::new()]
        } else {
            split_message(&text, MAX_MESSAGE_LEN)
        };

        let files: Vec<CreateAttachment> = message
            .attachments
            .iter()
            .filter_map(|a| {
                a.data
                    .as_ref()
                    .map(|data| CreateAttachment::bytes(data.to_vec(), a.name.clone()))
            })
            .collect();

        if self.config.uses_webhook() {
            let username = message
                .msg_config
                .get_str("webhook_title")
                .filter(|s| !s.is_empty());
            let avatar = message
                .msg_config
                .get_str("webhook_avatar")
                .filter(|s| !s.is_empty())
                .or_else(|| message.rich_header.as_ref().and_then(|h| h.avatar.as_deref()));
            self.send_webhook(chunks, files, username, avatar).await
        } else if self.config.bot_token.is_some() {
            self.send_bot(address, chunks, files).await
        } else {
            Err(SendError::NotReady {
                message: "no send method available".to_string(),
            })
        }
    }

    async fn listen(
        &self,
        coordinator: Arc<Coordinator>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let Some(token) = self.config.bot_token.clone().filter(|t| !t.is_empty()) else {
            warn!(
                instance = %self.instance_id,
                "No bot_token configured, receive disabled (send-only)"
            );
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILDS;

        let handler = DiscordEvents {
            instance_id: self.instance_id.clone(),
            coordinator,
        };
        let mut client = Client::builder(&token, intents)
            .event_handler(handler)
            .await?;
        let shard_manager = client.shard_manager.clone();

        tokio::select! {
            result = client.start() => {
                result?;
                info!(instance = %self.instance_id, "Discord client disconnected");
            }
            _ = async {
                loop {
                    if shutdown.changed().await.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            } => {
                info!(instance = %self.instance_id, "Initiating graceful Discord shutdown...");
                shard_manager.shutdown_all().await;
            }
        }
        Ok(())
    }
}

struct DiscordEvents {
    instance_id: String,
    coordinator: Arc<Coordinator>,
}

impl DiscordEvents {
    fn normalize(&self, message: &Message) -> Option<NormalizedMessage> {
        let attachments: Vec<AttachmentRef> = message
            .attachments
            .iter()
            .filter_map(|a| {
                let kind = a
                    .content_type
                    .as_deref()
                    .map(AttachmentKind::from_content_type)
                    .unwrap_or(AttachmentKind::File);
                AttachmentRef::remote(kind, a.url.clone())
                    .map(|r| r.with_name(a.filename.clone()).with_size(u64::from(a.size)))
            })
            .collect();

        if message.content.trim().is_empty() && attachments.is_empty() {
            return None;
        }

        let address = ChannelAddress::new()
            .with(
                "server_id",
                message
                    .guild_id
                    .map(|id| id.get().to_string())
                    .unwrap_or_default(),
            )
            .with("channel_id", message.channel_id.get().to_string());

        let author = &message.author;
        let display_name = author.global_name.clone().unwrap_or_else(|| author.name.clone());
        let sender =
            SenderInfo::new(display_name, author.id.get().to_string()).with_avatar(author.face());

        Some(
            NormalizedMessage::new(
                PLATFORM,
                self.instance_id.clone(),
                address,
                sender,
                message.content.clone(),
            )
            .with_attachments(attachments),
        )
    }
}

#[async_trait]
impl EventHandler for DiscordEvents {
    async fn ready(&self, _context: Context, ready: Ready) {
        info!(instance = %self.instance_id, "Discord logged in as {}", ready.user.name);
    }

    async fn message(&self, context: Context, message: Message) {
        if message.author.bot || message.author.id == context.cache.current_user().id {
            return;
        }
        // Messages from our own webhooks come back through the gateway
        if message.webhook_id.is_some() {
            return;
        }

        let Some(normalized) = self.normalize(&message) else {
            return;
        };
        debug!(
            instance = %self.instance_id,
            channel_id = %message.channel_id,
            "Discord message received"
        );
        let dispatch = self.coordinator.ingest(normalized);
        if dispatch.is_empty() {
            debug!(instance = %self.instance_id, "No rule matched, message dropped");
        } else {
            debug!(instance = %self.instance_id, targets = dispatch.len(), "Message dispatched");
        }
    }
}
