//! Rule matching and target resolution.
//!
//! Resolves an inbound (instance, channel address) pair against the loaded
//! rules, producing every target the message must be delivered to together
//! with the effective msg config for that target.

use std::collections::HashMap;

use tracing::debug;

use crate::common::ChannelAddress;
use crate::config::types::{MsgConfig, Rule};

/// One delivery produced by rule resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub instance_id: String,
    pub address: ChannelAddress,
    /// Rule base `msg` with the target's own override merged on top.
    pub msg_config: MsgConfig,
    /// Declaration index of the rule that produced this target.
    pub rule_index: usize,
}

/// Read-only rule table shared by every ingest call.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    /// Source instance -> indices of rules naming it as a source, ascending.
    by_source: HashMap<String, Vec<usize>>,
}

impl RuleEngine {
    /// Build the engine from validated rules.
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut by_source: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, rule) in rules.iter().enumerate() {
            let sources: Vec<&str> = match rule {
                Rule::Connect(rule) => rule.channels.iter().map(|(id, _)| id.as_str()).collect(),
                Rule::Forward(rule) => rule.from.iter().map(|(id, _)| id.as_str()).collect(),
            };
            for source in sources {
                let indices = by_source.entry(source.to_string()).or_default();
                if indices.last() != Some(&idx) {
                    indices.push(idx);
                }
            }
        }

        Self { rules, by_source }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every target for a message from `source_instance` at `source_address`.
    ///
    /// Rules are applied in declaration order and all matches are kept, so
    /// overlapping rules can yield the same target more than once.
    pub fn resolve(
        &self,
        source_instance: &str,
        source_address: &ChannelAddress,
    ) -> Vec<ResolvedTarget> {
        let Some(indices) = self.by_source.get(source_instance) else {
            debug!(source_instance, "No rule lists this instance as a source");
            return Vec::new();
        };

        let mut targets = Vec::new();
        for &idx in indices {
            match &self.rules[idx] {
                Rule::Connect(rule) => {
                    // Position of the source member, if this rule matches it
                    let member = rule.channels.iter().position(|(id, entry)| {
                        id == source_instance && source_address.matches(&entry.address)
                    });
                    let Some(member) = member else { continue };

                    for (pos, (id, entry)) in rule.channels.iter().enumerate() {
                        if pos == member {
                            continue;
                        }
                        targets.push(ResolvedTarget {
                            instance_id: id.clone(),
                            address: entry.address.clone(),
                            msg_config: rule.msg.merged(entry.msg.as_ref()),
                            rule_index: idx,
                        });
                    }
                }
                Rule::Forward(rule) => {
                    let matched = rule.from.iter().any(|(id, address)| {
                        id == source_instance && source_address.matches(address)
                    });
                    if !matched {
                        continue;
                    }

                    for (id, entry) in &rule.to {
                        if id == source_instance && source_address.matches(&entry.address) {
                            debug!(
                                rule = idx,
                                target_instance = %id,
                                "Skipping target identical to the source channel"
                            );
                            continue;
                        }
                        targets.push(ResolvedTarget {
                            instance_id: id.clone(),
                            address: entry.address.clone(),
                            msg_config: rule.msg.merged(entry.msg.as_ref()),
                            rule_index: idx,
                        });
                    }
                }
            }
        }

        if targets.is_empty() {
            debug!(
                source_instance,
                source_address = %source_address,
                "Message matched no rule"
            );
        }
        targets
    }
}
