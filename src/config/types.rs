//! Configuration type definitions.
//!
//! Two files feed the bridge: `config.json` (platform instances and their
//! credentials, plus the optional `bridge` section) and `rules.json` (routing
//! rules). Rules deserialize into `Raw*` shapes first; `config::validate`
//! turns them into [`Rule`]s or fails with every problem listed.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::{self, DeserializeOwned, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::ChannelAddress;

/// Name of the reserved key holding per-channel msg overrides.
pub const MSG_KEY: &str = "msg";

/// Name of the reserved top-level `config.json` section for bridge settings.
pub const BRIDGE_SECTION: &str = "bridge";

/// Root configuration loaded from `config.json`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Core bridge tuning.
    pub bridge: BridgeSettings,
    /// platform -> instance id -> driver config object.
    pub platforms: BTreeMap<String, BTreeMap<String, Value>>,
    /// The whole parsed file, kept for the credential scan.
    pub raw: Value,
}

impl Config {
    /// Every configured instance as (platform, instance id).
    pub fn instances(&self) -> impl Iterator<Item = (&str, &str)> {
        self.platforms.iter().flat_map(|(platform, instances)| {
            instances
                .keys()
                .map(move |id| (platform.as_str(), id.as_str()))
        })
    }

    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.platforms
            .values()
            .any(|instances| instances.contains_key(instance_id))
    }
}

/// Tuning knobs for the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSettings {
    /// Process-wide cap on concurrent outbound fetch/send work.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_head_timeout_secs")]
    pub head_timeout_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sends: default_max_concurrent_sends(),
            send_timeout_secs: default_send_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            head_timeout_secs: default_head_timeout_secs(),
        }
    }
}

impl BridgeSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout_secs)
    }
}

fn default_max_concurrent_sends() -> usize {
    32
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_head_timeout_secs() -> u64 {
    10
}

/// Formatting configuration for one (rule, target) pair.
///
/// `msg_format` is the template; every other key is a platform-specific
/// extension (e.g. `webhook_title`) passed through to the target driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgConfig(Map<String, Value>);

impl MsgConfig {
    /// Template used when `msg_format` is not configured.
    pub const DEFAULT_FORMAT: &'static str = "{msg}";

    /// Key of the template field.
    pub const FORMAT_KEY: &'static str = "msg_format";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Set a field, builder style.
    #[cfg(test)]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// The configured template, or `"{msg}"`.
    pub fn msg_format(&self) -> &str {
        self.get_str(Self::FORMAT_KEY)
            .unwrap_or(Self::DEFAULT_FORMAT)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Extension fields (everything except `msg_format`).
    pub fn extras(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0
            .iter()
            .filter(|(k, _)| k.as_str() != Self::FORMAT_KEY)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Shallow merge: keys of `overrides` replace keys of `self`.
    pub fn merged(&self, overrides: Option<&MsgConfig>) -> MsgConfig {
        let mut merged = self.0.clone();
        if let Some(overrides) = overrides {
            for (key, value) in &overrides.0 {
                merged.insert(key.clone(), value.clone());
            }
        }
        MsgConfig(merged)
    }
}

/// One member of a rule: a channel address plus an optional msg override.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEntry {
    pub address: ChannelAddress,
    pub msg: Option<MsgConfig>,
}

/// A validated routing rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// Symmetric: every member is a source and every other member a target.
    Connect(ConnectRule),
    /// Asymmetric: `from` members are sources, `to` members targets.
    Forward(ForwardRule),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRule {
    /// (instance id, entry) in declaration order.
    pub channels: Vec<(String, ChannelEntry)>,
    pub msg: MsgConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRule {
    pub from: Vec<(String, ChannelAddress)>,
    pub to: Vec<(String, ChannelEntry)>,
    pub msg: MsgConfig,
}

/// Root of `rules.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

/// A rule as written in `rules.json`, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRule {
    /// "connect" or "forward"; absent means forward.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub channels: Option<InstanceMap<RawChannelEntry>>,
    pub from: Option<InstanceMap<ChannelAddress>>,
    pub to: Option<InstanceMap<RawChannelEntry>>,
    pub msg: Option<Value>,
}

/// A channel entry as written: address keys plus the reserved `msg` key.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChannelEntry {
    pub address: ChannelAddress,
    pub msg: Option<Value>,
}

impl<'de> Deserialize<'de> for RawChannelEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut map = Map::<String, Value>::deserialize(deserializer)?;
        let msg = map.remove(MSG_KEY);
        let address = ChannelAddress::from_json_map(&map).map_err(de::Error::custom)?;
        Ok(Self { address, msg })
    }
}

/// Instance id -> value map that keeps declaration order and rejects
/// duplicate instance ids, which would make rule membership ambiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceMap<T>(pub Vec<(String, T)>);

impl<T> InstanceMap<T> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<'de, T> Deserialize<'de> for InstanceMap<T>
where
    T: DeserializeOwned,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct InstanceMapVisitor<T>(PhantomData<T>);

        impl<'de, T> Visitor<'de> for InstanceMapVisitor<T>
        where
            T: DeserializeOwned,
        {
            type Value = InstanceMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of instance ids")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, T)> = Vec::new();
                while let Some(key) = access.next_key::<String>()? {
                    if entries.iter().any(|(existing, _)| *existing == key) {
                        return Err(de::Error::custom(format!(
                            "instance '{}' appears more than once in the same rule block",
                            key
                        )));
                    }
                    let value = access.next_value::<T>()?;
                    entries.push((key, value));
                }
                Ok(InstanceMap(entries))
            }
        }

        deserializer.deserialize_map(InstanceMapVisitor(PhantomData))
    }
}
