//! Attachment relay.
//!
//! One [`RelaySession`] is created per ingested message and shared by every
//! target of that message. Each attachment is fetched at most once, bounded
//! by the largest limit among the upload targets, and the bytes are dropped
//! together with the session once the last target is done.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::bridge::driver::OutboundAttachment;
use crate::common::AttachmentRef;
use crate::media::{filename_for, FetchedMedia, MediaFetcher};

/// Attachments ready for one target plus the text lines replacing the ones
/// that could not be delivered as files.
#[derive(Debug, Default)]
pub struct RelayOutput {
    pub attachments: Vec<OutboundAttachment>,
    pub fallbacks: Vec<String>,
}

impl RelayOutput {
    /// Append the fallback lines to `text`, one per line.
    pub fn append_fallbacks(&self, text: &str) -> String {
        if self.fallbacks.is_empty() {
            return text.to_string();
        }
        let labels = self.fallbacks.join("\n");
        if text.is_empty() {
            labels
        } else {
            format!("{}\n{}", text, labels)
        }
    }
}

struct Slot {
    attachment: AttachmentRef,
    /// Fetch result; the error is kept as text for the log line.
    fetched: OnceCell<Result<FetchedMedia, String>>,
}

/// Shared fetch state for the attachments of one message.
pub struct RelaySession {
    fetcher: Arc<MediaFetcher>,
    slots: Vec<Slot>,
    fetch_limit: u64,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("attachments", &self.slots.len())
            .field("fetch_limit", &self.fetch_limit)
            .finish()
    }
}

impl RelaySession {
    /// `fetch_limit` should be the largest `max_file_size` among the targets
    /// that will call [`prepare`](Self::prepare).
    pub fn new(fetcher: Arc<MediaFetcher>, attachments: Vec<AttachmentRef>, fetch_limit: u64) -> Self {
        let slots = attachments
            .into_iter()
            .map(|attachment| Slot {
                attachment,
                fetched: OnceCell::new(),
            })
            .collect();
        Self {
            fetcher,
            slots,
            fetch_limit,
        }
    }

    /// Attachments with bytes for an upload-mode target accepting files up
    /// to `limit` bytes.
    pub async fn prepare(&self, limit: u64) -> RelayOutput {
        let mut output = RelayOutput::default();

        for slot in &self.slots {
            let attachment = &slot.attachment;

            if let Some(size) = attachment.size_bytes {
                if size > limit {
                    info!(
                        name = %attachment.name,
                        size,
                        limit,
                        "Attachment over target limit, sending text label"
                    );
                    output.fallbacks.push(attachment.fallback_label());
                    continue;
                }
            }

            let fetched = slot
                .fetched
                .get_or_init(|| async {
                    self.fetcher
                        .fetch_attachment(attachment, self.fetch_limit.max(limit))
                        .await
                        .map_err(|e| e.to_string())
                })
                .await;

            match fetched {
                Ok(media) if media.len() <= limit => {
                    output.attachments.push(OutboundAttachment {
                        kind: attachment.kind,
                        name: filename_for(&attachment.name, &media.content_type),
                        url: attachment.url().map(str::to_string),
                        size_bytes: Some(media.len()),
                        data: Some(media.data.clone()),
                    });
                }
                Ok(media) => {
                    info!(
                        name = %attachment.name,
                        size = media.len(),
                        limit,
                        "Fetched attachment over target limit, sending text label"
                    );
                    output.fallbacks.push(attachment.fallback_label());
                }
                Err(e) => {
                    debug!(name = %attachment.name, error = %e, "Attachment fetch failed, sending text label");
                    output.fallbacks.push(attachment.fallback_label());
                }
            }
        }

        output
    }

    /// Attachments as URL references for a reference-mode target. Nothing is
    /// downloaded; attachments without a URL degrade to text labels.
    pub fn references(&self, limit: u64) -> RelayOutput {
        let mut output = RelayOutput::default();

        for slot in &self.slots {
            let attachment = &slot.attachment;
            let oversized = attachment.size_bytes.is_some_and(|size| size > limit);

            match attachment.url() {
                Some(url) if !oversized => output.attachments.push(OutboundAttachment {
                    kind: attachment.kind,
                    name: attachment.name.clone(),
                    url: Some(url.to_string()),
                    size_bytes: attachment.size_bytes,
                    data: None,
                }),
                _ => output.fallbacks.push(attachment.fallback_label()),
            }
        }

        output
    }
}
