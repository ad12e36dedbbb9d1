//! Canonical message types for bridge communication.
//!
//! Every driver normalizes its inbound events into a [`NormalizedMessage`];
//! the bridge never sees a platform-specific type.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::common::error::FetchResult;
use crate::media::FetchedMedia;

/// Platform-specific key set identifying a conversation within an instance,
/// e.g. `{channel_id: "222"}` or `{server_id: "1", channel_id: "222"}`.
///
/// Values are normalized to strings so that `222` and `"222"` compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelAddress(BTreeMap<String, String>);

impl ChannelAddress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when every key declared by `declared` has the same value here.
    ///
    /// Keys absent from `self` compare as the empty string, so a declared
    /// empty value matches a missing key.
    pub fn matches(&self, declared: &ChannelAddress) -> bool {
        declared
            .iter()
            .all(|(key, expected)| self.get(key).unwrap_or("") == expected)
    }

    /// Build an address from a JSON object, normalizing scalar values.
    pub fn from_json_map(
        map: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, String> {
        let mut address = Self::new();
        for (key, value) in map {
            address.insert(key.clone(), scalar_to_string(key, value)?);
        }
        Ok(address)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for ChannelAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AddressVisitor;

        impl<'de> Visitor<'de> for AddressVisitor {
            type Value = ChannelAddress;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of channel address keys")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut address = ChannelAddress::new();
                while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
                    let value = scalar_to_string(&key, &value).map_err(de::Error::custom)?;
                    address.insert(key, value);
                }
                Ok(address)
            }
        }

        deserializer.deserialize_map(AddressVisitor)
    }
}

/// Render a JSON scalar as an address value.
fn scalar_to_string(key: &str, value: &serde_json::Value) -> Result<String, String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!(
            "address key '{}' must be a string, number or boolean (got {})",
            key, other
        )),
    }
}

/// Identity of the user who authored a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderInfo {
    /// Name shown on the source platform.
    pub display_name: String,
    /// Platform user id.
    pub native_user_id: String,
    /// Avatar URL, when the platform exposes one.
    pub avatar_url: Option<String>,
}

impl SenderInfo {
    pub fn new(display_name: impl Into<String>, native_user_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            native_user_id: native_user_id.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        let avatar_url = avatar_url.into();
        self.avatar_url = (!avatar_url.is_empty()).then_some(avatar_url);
        self
    }
}

/// Kind of media carried by an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Voice,
    Video,
    File,
}

impl AttachmentKind {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::File => "file",
        }
    }

    /// Capitalized name used in text-label fallbacks.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Image => "Image",
            Self::Voice => "Voice",
            Self::Video => "Video",
            Self::File => "File",
        }
    }

    /// Classify a MIME type.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            Self::Image
        } else if content_type.starts_with("video/") {
            Self::Video
        } else if content_type.starts_with("audio/") {
            Self::Voice
        } else {
            Self::File
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver-provided capability to download an attachment, for platforms whose
/// media needs authentication or a custom API call.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    /// Fetch at most `limit` bytes. Exceeding the limit is an error.
    async fn fetch(&self, limit: u64) -> FetchResult<FetchedMedia>;
}

/// Where the bytes of an attachment come from.
#[derive(Clone)]
pub enum AttachmentSource {
    /// Download `AttachmentRef::url` over HTTP.
    Remote,
    /// Bytes already held by the driver.
    Inline(Bytes),
    /// Driver-specific download.
    Custom(Arc<dyn AttachmentFetcher>),
}

impl fmt::Debug for AttachmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("Remote"),
            Self::Inline(data) => write!(f, "Inline({} bytes)", data.len()),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Describes one piece of media without necessarily holding its bytes.
///
/// The constructors guarantee that either a URL or a usable source exists.
#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub kind: AttachmentKind,
    /// Suggested filename (may be empty).
    pub name: String,
    /// Size in bytes when the source platform reports it.
    pub size_bytes: Option<u64>,
    url: Option<String>,
    source: AttachmentSource,
}

impl AttachmentRef {
    /// Attachment fetched from a URL. Returns `None` for an empty URL.
    pub fn remote(kind: AttachmentKind, url: impl Into<String>) -> Option<Self> {
        let url = url.into();
        if url.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            name: String::new(),
            size_bytes: None,
            url: Some(url),
            source: AttachmentSource::Remote,
        })
    }

    /// Attachment whose bytes the driver already has.
    #[allow(dead_code)]
    pub fn inline(kind: AttachmentKind, name: impl Into<String>, data: Bytes) -> Self {
        Self {
            kind,
            name: name.into(),
            size_bytes: Some(data.len() as u64),
            url: None,
            source: AttachmentSource::Inline(data),
        }
    }

    /// Attachment downloaded through a driver-provided capability.
    #[allow(dead_code)]
    pub fn with_fetcher(
        kind: AttachmentKind,
        name: impl Into<String>,
        fetcher: Arc<dyn AttachmentFetcher>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            size_bytes: None,
            url: None,
            source: AttachmentSource::Custom(fetcher),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    /// Attach a public URL to an inline or custom attachment, used for labels
    /// and reference-mode drivers.
    #[allow(dead_code)]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if !url.is_empty() {
            self.url = Some(url);
        }
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn source(&self) -> &AttachmentSource {
        &self.source
    }

    /// Text used when the attachment cannot be delivered as a file:
    /// `[Kind: name](url)` or `[Kind: name]`.
    pub fn fallback_label(&self) -> String {
        let label = if self.name.is_empty() {
            self.url.as_deref().unwrap_or("")
        } else {
            self.name.as_str()
        };
        match &self.url {
            Some(url) => format!("[{}: {}]({})", self.kind.label(), label, url),
            None => format!("[{}: {}]", self.kind.label(), label),
        }
    }
}

/// Platform-agnostic message produced by a driver for every inbound event.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    /// Driver family, e.g. "discord".
    pub platform: String,
    /// Configured instance name.
    pub instance_id: String,
    /// Conversation the message came from.
    pub source_address: ChannelAddress,
    pub sender: SenderInfo,
    /// Plain text content (may be empty).
    pub text: String,
    /// Attachments in original order.
    pub attachments: Vec<AttachmentRef>,
    /// Creation instant; diagnostics only.
    pub timestamp: DateTime<Utc>,
}

impl NormalizedMessage {
    pub fn new(
        platform: impl Into<String>,
        instance_id: impl Into<String>,
        source_address: ChannelAddress,
        sender: SenderInfo,
        text: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            instance_id: instance_id.into(),
            source_address,
            sender,
            text: text.into(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_subset_match() {
        let source = ChannelAddress::new()
            .with("server_id", "1")
            .with("channel_id", "222");
        let declared = ChannelAddress::new().with("channel_id", "222");

        assert!(source.matches(&declared));
        assert!(!declared.matches(&source));
        assert!(!source.matches(&ChannelAddress::new().with("channel_id", "333")));
    }

    #[test]
    fn test_address_deserialize_normalizes_numbers() {
        let address: ChannelAddress =
            serde_json::from_str(r#"{"group_id": 12345, "flag": true}"#).unwrap();
        assert_eq!(address.get("group_id"), Some("12345"));
        assert_eq!(address.get("flag"), Some("true"));

        let nested: Result<ChannelAddress, _> = serde_json::from_str(r#"{"a": {"b": 1}}"#);
        assert!(nested.is_err());
    }

    #[test]
    fn test_address_display() {
        let address = ChannelAddress::new().with("b", "2").with("a", "1");
        assert_eq!(address.to_string(), "a=1,b=2");
    }

    #[test]
    fn test_remote_attachment_requires_url() {
        assert!(AttachmentRef::remote(AttachmentKind::Image, "").is_none());
        assert!(AttachmentRef::remote(AttachmentKind::Image, "https://x/y.png").is_some());
    }

    #[test]
    fn test_fallback_label() {
        let att = AttachmentRef::remote(AttachmentKind::Image, "https://cdn/a.png")
            .unwrap()
            .with_name("a.png");
        assert_eq!(att.fallback_label(), "[Image: a.png](https://cdn/a.png)");

        let inline = AttachmentRef::inline(AttachmentKind::Voice, "note.ogg", Bytes::from_static(b"x"));
        assert_eq!(inline.fallback_label(), "[Voice: note.ogg]");
        assert_eq!(inline.size_bytes, Some(1));

        let unnamed = AttachmentRef::remote(AttachmentKind::File, "https://cdn/f").unwrap();
        assert_eq!(unnamed.fallback_label(), "[File: https://cdn/f](https://cdn/f)");
    }

    #[test]
    fn test_kind_from_content_type() {
        assert_eq!(AttachmentKind::from_content_type("image/png"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_content_type("audio/ogg"), AttachmentKind::Voice);
        assert_eq!(AttachmentKind::from_content_type("video/mp4"), AttachmentKind::Video);
        assert_eq!(AttachmentKind::from_content_type(""), AttachmentKind::File);
    }

    #[test]
    fn test_sender_empty_avatar_is_none() {
        let sender = SenderInfo::new("Alice", "1").with_avatar("");
        assert_eq!(sender.avatar_url, None);
    }
}
