//! Configuration file loading (JSON).

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::common::error::ConfigError;
use crate::config::types::{BridgeSettings, Config, Rule, RulesFile, BRIDGE_SECTION};
use crate::config::validate::build_rules;

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
        path: path.display().to_string(),
        source,
    })
}

/// Load `config.json` from a file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = read_file(path)?;
    parse_config(&path.display().to_string(), &content)
}

/// Parse `config.json` content. `origin` names the source in errors.
pub fn parse_config(origin: &str, content: &str) -> Result<Config, ConfigError> {
    let raw: Value = serde_json::from_str(content).map_err(|e| ConfigError::ParseError {
        path: origin.to_string(),
        message: e.to_string(),
    })?;

    let root = raw.as_object().ok_or_else(|| ConfigError::InvalidValue {
        field: "<root>".to_string(),
        message: "config must be a JSON object".to_string(),
    })?;

    let bridge = match root.get(BRIDGE_SECTION) {
        Some(section) => BridgeSettings::deserialize_section(section)?,
        None => BridgeSettings::default(),
    };

    let mut platforms = BTreeMap::new();
    for (platform, instances) in root {
        if platform == BRIDGE_SECTION {
            continue;
        }
        let instances = instances.as_object().ok_or_else(|| ConfigError::InvalidValue {
            field: platform.clone(),
            message: "expected a map of instance id -> instance config".to_string(),
        })?;

        let mut by_id = BTreeMap::new();
        for (instance_id, instance) in instances {
            if !instance.is_object() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.{}", platform, instance_id),
                    message: "instance config must be an object".to_string(),
                });
            }
            by_id.insert(instance_id.clone(), instance.clone());
        }
        platforms.insert(platform.clone(), by_id);
    }

    Ok(Config {
        bridge,
        platforms,
        raw,
    })
}

impl BridgeSettings {
    fn deserialize_section(section: &Value) -> Result<Self, ConfigError> {
        let settings: BridgeSettings =
            serde_json::from_value(section.clone()).map_err(|e| ConfigError::InvalidValue {
                field: BRIDGE_SECTION.to_string(),
                message: e.to_string(),
            })?;
        if settings.max_concurrent_sends == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.max_concurrent_sends", BRIDGE_SECTION),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(settings)
    }
}

/// Load and validate `rules.json`.
pub fn load_rules(path: impl AsRef<Path>) -> Result<Vec<Rule>, ConfigError> {
    let path = path.as_ref();
    let content = read_file(path)?;
    parse_rules(&path.display().to_string(), &content)
}

/// Parse and validate `rules.json` content.
pub fn parse_rules(origin: &str, content: &str) -> Result<Vec<Rule>, ConfigError> {
    let file: RulesFile = serde_json::from_str(content).map_err(|e| ConfigError::ParseError {
        path: origin.to_string(),
        message: e.to_string(),
    })?;
    build_rules(&file.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config_platforms_and_settings() {
        let config = parse_config(
            "config.json",
            r#"{
                "bridge": {"max_concurrent_sends": 4},
                "discord": {"dc_main": {"bot_token": "abc"}},
                "webhook": {"hook": {"url": "https://example.com/in"}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.bridge.max_concurrent_sends, 4);
        assert_eq!(config.bridge.send_timeout_secs, 30);
        assert!(config.has_instance("dc_main"));
        assert!(config.has_instance("hook"));
        assert!(!config.platforms.contains_key("bridge"));
        let instances: Vec<_> = config.instances().collect();
        assert_eq!(instances, vec![("discord", "dc_main"), ("webhook", "hook")]);
    }

    #[test]
    fn test_parse_config_rejects_non_object_instance() {
        let err = parse_config("config.json", r#"{"discord": {"dc": "oops"}}"#).unwrap_err();
        assert!(err.to_string().contains("discord.dc"));
    }

    #[test]
    fn test_parse_config_rejects_zero_concurrency() {
        let err =
            parse_config("config.json", r#"{"bridge": {"max_concurrent_sends": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_sends"));
    }

    #[test]
    fn test_parse_config_syntax_error() {
        let err = parse_config("config.json", "{not json").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_parse_rules_duplicate_instance_is_parse_error() {
        let err = parse_rules(
            "rules.json",
            r#"{"rules": [{"type": "connect", "channels": {"a": {"id": 1}, "a": {"id": 2}}}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_load_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();

        let config_path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, r#"{{"webhook": {{"hook": {{"url": "https://example.com"}}}}}}"#).unwrap();

        let rules_path = dir.path().join("rules.json");
        std::fs::write(
            &rules_path,
            r#"{"rules": [{"from": {"a": {"id": "1"}}, "to": {"hook": {"room": "x"}}}]}"#,
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert!(config.has_instance("hook"));
        let rules = load_rules(&rules_path).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_rules(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError { .. }));
    }
}
