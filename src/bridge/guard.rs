//! Credential registry and outbound leak guard.
//!
//! Every secret-looking string in `config.json` is registered once at
//! startup. Rendered outbound text is checked against the set before any
//! driver sees it, so a bridged conversation can never be used to read a
//! token back out.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

/// Config keys whose string values are treated as secrets (substring match,
/// case-insensitive).
const SECRET_KEY_PATTERNS: &[&str] = &["token", "secret", "password", "webhook_url"];

/// Values shorter than this are never registered.
pub const MIN_SECRET_LEN: usize = 8;

/// Replacement used by [`CredentialRegistry::redact`].
const REDACTED: &str = "***";

/// Read-only set of configured secrets.
#[derive(Clone, Default)]
pub struct CredentialRegistry {
    /// Longest first, so redaction handles secrets that contain others.
    secrets: Vec<String>,
}

impl fmt::Debug for CredentialRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRegistry")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

impl CredentialRegistry {
    /// Collect secrets from a parsed configuration tree.
    pub fn from_config(config: &Value) -> Self {
        let mut found = BTreeSet::new();
        collect(config, &mut found);
        Self::from_secrets(found)
    }

    /// Build from explicit values. Short values are dropped.
    pub fn from_secrets<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|s| s.chars().count() >= MIN_SECRET_LEN)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { secrets }
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// True when `text` contains any registered secret.
    pub fn scan(&self, text: &str) -> bool {
        !text.is_empty() && self.secrets.iter().any(|s| text.contains(s.as_str()))
    }

    /// `text` with every registered secret replaced by `***`, for logging.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEY_PATTERNS.iter().any(|p| key.contains(p))
}

fn collect(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::String(s) if is_secret_key(key) => {
                        let s = s.trim();
                        if !s.is_empty() {
                            found.insert(s.to_string());
                        }
                    }
                    other => collect(other, found),
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect(item, found)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> CredentialRegistry {
        CredentialRegistry::from_config(&json!({
            "discord": {
                "dc_main": {
                    "bot_token": "sk_live_abcdef123456",
                    "webhook_url": "https://discord.com/api/webhooks/1/abcdefgh",
                    "channel_name": "general-chat-room"
                }
            },
            "slack": {
                "sl": {
                    "signing_secret": "ok",
                    "nested": [{"app_password": "hunter2hunter2"}]
                }
            }
        }))
    }

    #[test]
    fn test_collects_secret_keys_only() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.scan("token is sk_live_abcdef123456 ok"));
        assert!(registry.scan("see https://discord.com/api/webhooks/1/abcdefgh"));
        assert!(registry.scan("hunter2hunter2"));
        assert!(!registry.scan("general-chat-room"));
    }

    #[test]
    fn test_short_values_are_never_registered() {
        let registry = registry();
        assert!(!registry.scan("ok"));
        assert!(!registry.scan("that's ok with me"));
        assert!(CredentialRegistry::from_secrets(["1234567"]).is_empty());
    }

    #[test]
    fn test_clean_text_passes() {
        let registry = registry();
        assert!(!registry.scan("hello everyone"));
        assert!(!registry.scan(""));
        assert!(!CredentialRegistry::default().scan("sk_live_abcdef123456"));
    }

    #[test]
    fn test_redact() {
        let registry = CredentialRegistry::from_secrets(["abcdefgh", "xxabcdefghyy"]);
        assert_eq!(registry.redact("a xxabcdefghyy b abcdefgh"), "a *** b ***");
        assert_eq!(registry.redact("nothing here"), "nothing here");
    }

    #[test]
    fn test_debug_hides_values() {
        let debug = format!("{:?}", registry());
        assert!(!debug.contains("sk_live"));
        assert!(debug.contains('3'));
    }
}
