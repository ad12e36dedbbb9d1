//! Bounded HTTP download of attachment bytes.

use std::time::Duration;

use bytes::BytesMut;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use tracing::debug;

use crate::common::error::{FetchError, FetchResult};
use crate::common::{AttachmentRef, AttachmentSource};

use super::{content_type_for, FetchedMedia, OCTET_STREAM};

/// Default timeout for the HEAD pre-flight.
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a whole download.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Downloads attachments without ever buffering more than the caller's limit.
#[derive(Debug, Clone)]
pub struct MediaFetcher {
    client: reqwest::Client,
    head_timeout: Duration,
    fetch_timeout: Duration,
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_HEAD_TIMEOUT, DEFAULT_FETCH_TIMEOUT)
    }
}

impl MediaFetcher {
    pub fn new(head_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            head_timeout,
            fetch_timeout,
        }
    }

    /// Obtain the bytes of an attachment, at most `limit` of them.
    pub async fn fetch_attachment(
        &self,
        attachment: &AttachmentRef,
        limit: u64,
    ) -> FetchResult<FetchedMedia> {
        let media = match attachment.source() {
            AttachmentSource::Inline(data) => {
                FetchedMedia::new(data.clone(), content_type_for(&attachment.name))
            }
            AttachmentSource::Remote => {
                let url = attachment.url().ok_or(FetchError::EmptyUrl)?;
                self.fetch_url(url, limit).await?
            }
            AttachmentSource::Custom(fetcher) => {
                tokio::time::timeout(self.fetch_timeout, fetcher.fetch(limit))
                    .await
                    .map_err(|_| FetchError::Timeout)??
            }
        };

        if media.len() > limit {
            return Err(FetchError::TooLarge {
                size: media.len(),
                limit,
            });
        }
        Ok(media)
    }

    /// Download `url`, aborting once more than `limit` bytes have arrived.
    ///
    /// A HEAD request runs first so that obviously oversized files are
    /// skipped without downloading; servers that reject HEAD fall through to
    /// the streamed GET.
    pub async fn fetch_url(&self, url: &str, limit: u64) -> FetchResult<FetchedMedia> {
        if url.is_empty() {
            return Err(FetchError::EmptyUrl);
        }

        if let Some(size) = self.preflight_size(url).await {
            if size > limit {
                debug!(size, limit, "Skipping download: Content-Length over limit");
                return Err(FetchError::TooLarge { size, limit });
            }
        }

        tokio::time::timeout(self.fetch_timeout, self.download(url, limit))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    /// Content-Length reported by a HEAD request, if any.
    async fn preflight_size(&self, url: &str) -> Option<u64> {
        let response = tokio::time::timeout(self.head_timeout, self.client.head(url).send())
            .await
            .ok()?
            .ok()?;

        if !response.status().is_success() {
            return None;
        }
        header_content_length(&response)
    }

    async fn download(&self, url: &str, limit: u64) -> FetchResult<FetchedMedia> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        if let Some(size) = header_content_length(&response) {
            if size > limit {
                return Err(FetchError::TooLarge { size, limit });
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| OCTET_STREAM.to_string());

        let mut buffer = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            let size = (buffer.len() + chunk.len()) as u64;
            if size > limit {
                debug!(size, limit, "Download exceeded limit, aborting");
                return Err(FetchError::TooLarge { size, limit });
            }
            buffer.extend_from_slice(&chunk);
        }

        Ok(FetchedMedia::new(buffer.freeze(), content_type))
    }
}

fn header_content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
