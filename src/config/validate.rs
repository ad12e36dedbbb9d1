//! Configuration validation.
//!
//! Turns raw rules into validated [`Rule`]s and reports every problem at
//! once, so a broken `rules.json` fails before any driver starts.

use serde_json::Value;

use crate::common::error::ConfigError;
use crate::config::types::{
    ChannelEntry, Config, ConnectRule, ForwardRule, MsgConfig, RawChannelEntry, RawRule, Rule,
};

/// Validate raw rules and convert them, collecting every error.
pub fn build_rules(raw_rules: &[RawRule]) -> Result<Vec<Rule>, ConfigError> {
    let mut errors = Vec::new();
    let mut rules = Vec::with_capacity(raw_rules.len());

    for (i, raw) in raw_rules.iter().enumerate() {
        if let Some(rule) = build_rule(i, raw, &mut errors) {
            rules.push(rule);
        }
    }

    if errors.is_empty() {
        Ok(rules)
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}

fn build_rule(i: usize, raw: &RawRule, errors: &mut Vec<String>) -> Option<Rule> {
    let before = errors.len();
    let msg = parse_msg(&format!("rules[{}].msg", i), raw.msg.as_ref(), errors);

    let rule = match raw.kind.as_deref().map(str::to_lowercase).as_deref() {
        Some("connect") => {
            if raw.from.is_some() || raw.to.is_some() {
                errors.push(format!(
                    "rules[{}]: connect rules use 'channels', not 'from'/'to'",
                    i
                ));
            }
            let channels = match &raw.channels {
                Some(channels) if channels.len() >= 2 => channels,
                Some(_) => {
                    errors.push(format!(
                        "rules[{}].channels must list at least two channels",
                        i
                    ));
                    return None;
                }
                None => {
                    errors.push(format!("rules[{}].channels is required for a connect rule", i));
                    return None;
                }
            };

            let channels = channels
                .iter()
                .map(|(instance, entry)| {
                    let path = format!("rules[{}].channels.{}", i, instance);
                    (instance.to_string(), build_entry(&path, entry, errors))
                })
                .collect();

            Rule::Connect(ConnectRule { channels, msg })
        }
        None | Some("forward") => {
            if raw.channels.is_some() {
                errors.push(format!(
                    "rules[{}]: forward rules use 'from'/'to', not 'channels' (missing \"type\": \"connect\"?)",
                    i
                ));
            }
            let from = match &raw.from {
                Some(from) if !from.is_empty() => from,
                _ => {
                    errors.push(format!("rules[{}].from is required and must not be empty", i));
                    return None;
                }
            };
            let to = match &raw.to {
                Some(to) if !to.is_empty() => to,
                _ => {
                    errors.push(format!("rules[{}].to is required and must not be empty", i));
                    return None;
                }
            };

            for (instance, address) in from.iter() {
                if address.is_empty() {
                    errors.push(format!(
                        "rules[{}].from.{} has no channel address keys",
                        i, instance
                    ));
                }
            }

            let to: Vec<(String, ChannelEntry)> = to
                .iter()
                .map(|(instance, entry)| {
                    let path = format!("rules[{}].to.{}", i, instance);
                    (instance.to_string(), build_entry(&path, entry, errors))
                })
                .collect();

            for (instance, entry) in &to {
                let loops = from
                    .iter()
                    .any(|(src, address)| src == instance && *address == entry.address);
                if loops {
                    errors.push(format!(
                        "rules[{}]: '{}' forwards to the exact channel it reads from",
                        i, instance
                    ));
                }
            }

            Rule::Forward(ForwardRule {
                from: from
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                to,
                msg,
            })
        }
        Some(other) => {
            errors.push(format!(
                "rules[{}].type '{}' is invalid (use: connect, forward)",
                i, other
            ));
            return None;
        }
    };

    (errors.len() == before).then_some(rule)
}

fn build_entry(path: &str, raw: &RawChannelEntry, errors: &mut Vec<String>) -> ChannelEntry {
    if raw.address.is_empty() {
        errors.push(format!("{} has no channel address keys", path));
    }
    let msg = raw
        .msg
        .as_ref()
        .map(|value| parse_msg(&format!("{}.msg", path), Some(value), errors));

    ChannelEntry {
        address: raw.address.clone(),
        msg,
    }
}

fn parse_msg(path: &str, value: Option<&Value>, errors: &mut Vec<String>) -> MsgConfig {
    match value {
        None | Some(Value::Null) => MsgConfig::new(),
        Some(Value::Object(map)) => {
            if let Some(format) = map.get(MsgConfig::FORMAT_KEY) {
                if !format.is_string() {
                    errors.push(format!("{}.msg_format must be a string", path));
                }
            }
            MsgConfig::from_map(map.clone())
        }
        Some(_) => {
            errors.push(format!("{} must be an object", path));
            MsgConfig::new()
        }
    }
}

/// Instances referenced by rules but absent from `config.json`.
///
/// These are not fatal: the instance may be intentionally disabled.
pub fn unknown_instances(rules: &[Rule], config: &Config) -> Vec<String> {
    let mut unknown: Vec<String> = Vec::new();
    let mut note = |instance: &str| {
        if !config.has_instance(instance) && !unknown.iter().any(|u| u == instance) {
            unknown.push(instance.to_string());
        }
    };

    for rule in rules {
        match rule {
            Rule::Connect(rule) => rule.channels.iter().for_each(|(id, _)| note(id.as_str())),
            Rule::Forward(rule) => {
                rule.from.iter().for_each(|(id, _)| note(id.as_str()));
                rule.to.iter().for_each(|(id, _)| note(id.as_str()));
            }
        }
    }
    unknown
}
