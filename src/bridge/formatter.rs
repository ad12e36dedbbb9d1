//! Template rendering for outbound messages.
//!
//! Substitutes message variables into `msg_format` and pulls out the optional
//! `<richheader title="..." content="..."/>` marker. Supported variables:
//! `{platform}`, `{from}`, `{instance_id}`, `{username}`, `{user_id}`,
//! `{user_avatar}`, `{msg}`. Anything else in braces is left as written.

use fancy_regex::Regex;
use serde_json::Value;

use crate::common::NormalizedMessage;
use crate::config::types::MsgConfig;

/// Variables available to templates, borrowed from one message.
#[derive(Debug, Clone, Default)]
pub struct FormatContext<'a> {
    pub platform: &'a str,
    pub instance_id: &'a str,
    pub username: &'a str,
    pub user_id: &'a str,
    pub user_avatar: &'a str,
    pub msg: &'a str,
}

impl<'a> FormatContext<'a> {
    pub fn from_message(message: &'a NormalizedMessage) -> Self {
        Self {
            platform: &message.platform,
            instance_id: &message.instance_id,
            username: &message.sender.display_name,
            user_id: &message.sender.native_user_id,
            user_avatar: message.sender.avatar_url.as_deref().unwrap_or(""),
            msg: &message.text,
        }
    }

    fn lookup(&self, name: &str) -> Option<&'a str> {
        match name {
            "platform" => Some(self.platform),
            "from" | "instance_id" => Some(self.instance_id),
            "username" => Some(self.username),
            "user_id" => Some(self.user_id),
            "user_avatar" => Some(self.user_avatar),
            "msg" => Some(self.msg),
            _ => None,
        }
    }
}

/// Replace known `{name}` tokens in one left-to-right pass.
///
/// Substituted values are never rescanned, so a message containing `{msg}`
/// comes out literally.
pub fn substitute(template: &str, ctx: &FormatContext) -> String {
    let mut out = String::with_capacity(template.len() + ctx.msg.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after
            .find('}')
            .and_then(|close| ctx.lookup(&after[..close]).map(|v| (close, v)));

        match value {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Structured sender header pulled out of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichHeader {
    pub title: String,
    pub content: String,
    pub avatar: Option<String>,
}

impl RichHeader {
    /// Plain-text form for drivers that cannot render headers natively.
    pub fn fold_prefix(&self) -> String {
        match (self.title.is_empty(), self.content.is_empty()) {
            (false, false) => format!("[{} · {}] ", self.title, self.content),
            (false, true) => format!("[{}] ", self.title),
            (true, false) => format!("[{}] ", self.content),
            (true, true) => String::new(),
        }
    }

    /// Prepend the folded header to `text`.
    pub fn fold_into(&self, text: &str) -> String {
        format!("{}{}", self.fold_prefix(), text)
    }
}

/// Result of rendering one message for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub text: String,
    pub rich_header: Option<RichHeader>,
    /// Extension fields with string values template-substituted.
    pub msg_config: MsgConfig,
}

/// Renders `msg_format` templates. Holds the compiled marker patterns.
#[derive(Debug)]
pub struct MessageFormatter {
    header_pattern: Regex,
    attr_pattern: Regex,
}

impl Default for MessageFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFormatter {
    pub fn new() -> Self {
        Self {
            header_pattern: Regex::new(r#"(?i)<richheader(?:\s+\w+\s*=\s*"[^"]*")*\s*/>"#).unwrap(),
            attr_pattern: Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).unwrap(),
        }
    }

    /// Render `message` with `msg_config`.
    ///
    /// The rich header marker is taken from the template, not from the
    /// substituted text, so user-supplied text cannot inject one. Only the
    /// first marker is honored; later ones are dropped.
    pub fn render(&self, message: &NormalizedMessage, msg_config: &MsgConfig) -> Rendered {
        let ctx = FormatContext::from_message(message);
        let template = msg_config.msg_format();

        let (stripped, marker) = self.strip_markers(template);
        let rich_header = marker.map(|marker| self.parse_header(marker, &ctx));

        let mut text = substitute(&stripped, &ctx);
        if stripped.len() != template.len() {
            text = text.trim().to_string();
        }

        Rendered {
            text,
            rich_header,
            msg_config: render_extras(msg_config, &ctx),
        }
    }

    /// Template with every marker removed, plus the first marker found.
    fn strip_markers<'t>(&self, template: &'t str) -> (String, Option<&'t str>) {
        let mut stripped = String::with_capacity(template.len());
        let mut first = None;
        let mut last_end = 0;

        for found in self.header_pattern.find_iter(template) {
            let Ok(found) = found else { break };
            stripped.push_str(&template[last_end..found.start()]);
            if first.is_none() {
                first = Some(found.as_str());
            }
            last_end = found.end();
        }
        stripped.push_str(&template[last_end..]);
        (stripped, first)
    }

    fn parse_header(&self, marker: &str, ctx: &FormatContext) -> RichHeader {
        let mut header = RichHeader::default();

        for caps in self.attr_pattern.captures_iter(marker) {
            let Ok(caps) = caps else { break };
            let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let value = substitute(value.as_str(), ctx);
            match name.as_str().to_ascii_lowercase().as_str() {
                "title" => header.title = value,
                "content" => header.content = value,
                "avatar" if !value.is_empty() => header.avatar = Some(value),
                _ => {}
            }
        }
        header
    }
}

fn render_extras(msg_config: &MsgConfig, ctx: &FormatContext) -> MsgConfig {
    let mut rendered = MsgConfig::new();
    for (key, value) in msg_config.extras() {
        let value = match value {
            Value::String(s) => Value::String(substitute(s, ctx)),
            other => other.clone(),
        };
        rendered.insert(key, value);
    }
    rendered
}

/// Find the last UTF-8 char boundary at or before `byte_index` in `s`.
fn floor_char_boundary(s: &str, byte_index: usize) -> usize {
    if byte_index >= s.len() {
        return s.len();
    }
    let mut i = byte_index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Split text into chunks of at most `max_len` bytes for platforms with a
/// message length cap.
///
/// Prefers line breaks, then spaces, and never cuts a UTF-8 character.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let split_at = floor_char_boundary(remaining, max_len);
        if split_at == 0 {
            // max_len is smaller than the first character: emit it alone
            let first_end = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
            chunks.push(remaining[..first_end].to_string());
            remaining = &remaining[first_end..];
            continue;
        }

        let window = &remaining[..split_at];
        match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(idx) if idx > 0 => {
                chunks.push(remaining[..idx].to_string());
                remaining = &remaining[idx + 1..];
            }
            _ => {
                chunks.push(window.to_string());
                remaining = &remaining[split_at..];
            }
        }
    }

    chunks
}
