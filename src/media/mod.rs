//! Attachment download and naming helpers.

pub mod fetch;

use bytes::Bytes;

pub use fetch::MediaFetcher;

/// Default per-attachment limit when a driver does not configure one (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Fallback MIME type for unknown payloads.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Downloaded attachment bytes.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub data: Bytes,
    pub content_type: String,
}

impl FetchedMedia {
    pub fn new(data: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            data,
            content_type: content_type.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// (MIME type, extension, default filename)
const MIME_TABLE: &[(&str, &str, &str)] = &[
    ("image/jpeg", "jpg", "photo.jpg"),
    ("image/png", "png", "photo.png"),
    ("image/gif", "gif", "image.gif"),
    ("image/webp", "webp", "image.webp"),
    ("video/mp4", "mp4", "video.mp4"),
    ("video/webm", "webm", "video.webm"),
    ("audio/ogg", "ogg", "voice.ogg"),
    ("audio/mpeg", "mp3", "audio.mp3"),
    ("audio/aac", "aac", "audio.aac"),
    ("audio/amr", "amr", "voice.amr"),
];

/// Pick a filename for an upload.
///
/// A supplied name is kept, except that a `.tmp` extension (some CDNs serve
/// every image that way) is replaced by one derived from the MIME type. An
/// empty name gets a MIME-derived default.
pub fn filename_for(name: &str, content_type: &str) -> String {
    let entry = MIME_TABLE.iter().find(|(mime, _, _)| *mime == content_type);

    if !name.is_empty() {
        if let (Some(stem), Some((_, ext, _))) = (name.strip_suffix(".tmp"), entry) {
            return format!("{}.{}", stem, ext);
        }
        return name.to_string();
    }

    entry
        .map(|(_, _, default)| default.to_string())
        .unwrap_or_else(|| "attachment.bin".to_string())
}

/// Guess a MIME type from a filename extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return OCTET_STREAM,
    };
    let ext = if ext == "jpeg" { "jpg".to_string() } else { ext };

    MIME_TABLE
        .iter()
        .find(|(_, e, _)| *e == ext)
        .map(|(mime, _, _)| *mime)
        .unwrap_or(OCTET_STREAM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_keeps_supplied_name() {
        assert_eq!(filename_for("cat.png", "image/png"), "cat.png");
        assert_eq!(filename_for("notes.txt", "text/plain"), "notes.txt");
    }

    #[test]
    fn test_filename_replaces_tmp_extension() {
        assert_eq!(filename_for("abc123.tmp", "image/webp"), "abc123.webp");
        // Unknown MIME keeps the .tmp name
        assert_eq!(filename_for("abc123.tmp", "text/plain"), "abc123.tmp");
    }

    #[test]
    fn test_filename_defaults() {
        assert_eq!(filename_for("", "image/jpeg"), "photo.jpg");
        assert_eq!(filename_for("", "audio/ogg"), "voice.ogg");
        assert_eq!(filename_for("", "application/zip"), "attachment.bin");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.PNG"), "image/png");
        assert_eq!(content_type_for("b.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("noext"), OCTET_STREAM);
        assert_eq!(content_type_for("c.xyz"), OCTET_STREAM);
    }
}
