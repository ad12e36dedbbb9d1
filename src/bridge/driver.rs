//! Platform driver contract.
//!
//! Every platform instance implements [`Driver`]. The coordinator only ever
//! holds `Arc<dyn Driver>`, never a concrete platform type.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::bridge::formatter::RichHeader;
use crate::bridge::orchestrator::Coordinator;
use crate::common::error::SendResult;
use crate::common::{AttachmentKind, ChannelAddress};
use crate::config::types::MsgConfig;
use crate::media::DEFAULT_MAX_FILE_SIZE;

/// How a driver wants attachments delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentMode {
    /// The core fetches the bytes and hands them over.
    Upload,
    /// The driver only forwards URLs; nothing is downloaded.
    Reference,
}

/// One attachment as handed to a driver.
#[derive(Debug, Clone)]
pub struct OutboundAttachment {
    pub kind: AttachmentKind,
    /// Upload filename (already derived from the MIME type when needed).
    pub name: String,
    pub url: Option<String>,
    pub size_bytes: Option<u64>,
    /// Present in [`AttachmentMode::Upload`].
    pub data: Option<Bytes>,
}

/// A fully rendered message for one target.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub text: String,
    /// Only set for drivers that render headers natively; others receive it
    /// folded into `text`.
    pub rich_header: Option<RichHeader>,
    /// In the source message's order.
    pub attachments: Vec<OutboundAttachment>,
    /// Rendered extension fields (`webhook_title`, ...).
    pub msg_config: MsgConfig,
}

impl OutboundMessage {
    #[cfg(test)]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A configured platform instance.
///
/// When a platform cannot carry text and attachments in one call, `send`
/// must deliver the text first and then the attachments in order.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver family, e.g. "discord".
    fn platform(&self) -> &str;

    /// Largest attachment this instance accepts, in bytes.
    fn max_file_size(&self) -> u64 {
        DEFAULT_MAX_FILE_SIZE
    }

    fn supports_rich_header(&self) -> bool {
        false
    }

    fn attachment_mode(&self) -> AttachmentMode {
        AttachmentMode::Upload
    }

    /// Deliver one message to `address`.
    async fn send(&self, address: &ChannelAddress, message: OutboundMessage) -> SendResult<()>;

    /// Run one session of the inbound loop, calling
    /// [`Coordinator::ingest`] for every accepted event.
    ///
    /// Send-only drivers keep the default, which idles until shutdown.
    async fn listen(
        &self,
        coordinator: Arc<Coordinator>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let _ = coordinator;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
