//! Generic outgoing webhook driver (send-only).
//!
//! Every routed message becomes one JSON request to the configured URL:
//!
//! ```json
//! {"text": "...", "channel": {...}, "attachments": [{"type", "url", "name", "size"}], ...}
//! ```
//!
//! Extension fields from the msg config are merged into the top level.
//! Attachments are passed by URL only.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::bridge::driver::{AttachmentMode, Driver, OutboundMessage};
use crate::common::error::{SendError, SendResult};
use crate::common::ChannelAddress;
use crate::media::DEFAULT_MAX_FILE_SIZE;

pub const PLATFORM: &str = "webhook";

/// Longest response body echoed into an error.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl WebhookMethod {
    fn as_method(self) -> Method {
        match self {
            WebhookMethod::Post => Method::POST,
            WebhookMethod::Put => Method::PUT,
            WebhookMethod::Patch => Method::PATCH,
        }
    }
}

/// `webhook.<instance>` section of `config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: WebhookMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub max_file_size: Option<u64>,
}

pub struct WebhookDriver {
    instance_id: String,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookDriver {
    pub fn new(instance_id: impl Into<String>, config: WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            instance_id: instance_id.into(),
            config,
            client,
        })
    }

    fn payload(address: &ChannelAddress, message: &OutboundMessage) -> Value {
        let text = match &message.rich_header {
            Some(header) => {
                let prefix = header.fold_prefix();
                let prefix = prefix.trim_end();
                if message.text.is_empty() {
                    prefix.to_string()
                } else {
                    format!("{}\n{}", prefix, message.text)
                }
            }
            None => message.text.clone(),
        };

        let channel: Map<String, Value> = address
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();

        let attachments: Vec<Value> = message
            .attachments
            .iter()
            .map(|a| {
                json!({
                    "type": a.kind.as_str(),
                    "url": a.url,
                    "name": a.name,
                    "size": a.size_bytes,
                })
            })
            .collect();

        let mut payload = Map::new();
        payload.insert("text".to_string(), Value::String(text));
        payload.insert("channel".to_string(), Value::Object(channel));
        payload.insert("attachments".to_string(), Value::Array(attachments));
        for (key, value) in message.msg_config.extras() {
            if !payload.contains_key(key) {
                payload.insert(key.to_string(), value.clone());
            }
        }
        Value::Object(payload)
    }
}

#[async_trait]
impl Driver for WebhookDriver {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn max_file_size(&self) -> u64 {
        self.config.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE)
    }

    /// Headers are rendered as a `[title · content]` line of their own.
    fn supports_rich_header(&self) -> bool {
        true
    }

    fn attachment_mode(&self) -> AttachmentMode {
        AttachmentMode::Reference
    }

    async fn send(&self, address: &ChannelAddress, message: OutboundMessage) -> SendResult<()> {
        let payload = Self::payload(address, &message);

        let mut request = self
            .client
            .request(self.config.method.as_method(), &self.config.url)
            .json(&payload);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        debug!(instance = %self.instance_id, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}
