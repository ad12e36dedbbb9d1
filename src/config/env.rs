//! Environment variable overrides for file locations.
//!
//! - `NEXTBRIDGE_DATA_PATH` - directory holding config and rules (default `data`)
//! - `NEXTBRIDGE_CONFIG` - path of the instance config file
//! - `NEXTBRIDGE_RULES` - path of the rules file

use std::env;
use std::path::PathBuf;

/// Environment variable prefix for all overrides.
const ENV_PREFIX: &str = "NEXTBRIDGE";

const DEFAULT_DATA_PATH: &str = "data";

fn var(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Data directory from `NEXTBRIDGE_DATA_PATH`, or `data`.
pub fn get_data_path() -> PathBuf {
    PathBuf::from(var("DATA_PATH").unwrap_or_else(|| DEFAULT_DATA_PATH.to_string()))
}

/// Instance config path from `NEXTBRIDGE_CONFIG`, or `<data>/config.json`.
pub fn get_config_path() -> PathBuf {
    var("CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| get_data_path().join("config.json"))
}

/// Rules path from `NEXTBRIDGE_RULES`, or `<data>/rules.json`.
pub fn get_rules_path() -> PathBuf {
    var("RULES")
        .map(PathBuf::from)
        .unwrap_or_else(|| get_data_path().join("rules.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "NEXTBRIDGE");
    }

    #[test]
    fn test_default_paths() {
        // Only meaningful when the overrides are unset in the test environment
        if var("DATA_PATH").is_none() && var("CONFIG").is_none() && var("RULES").is_none() {
            assert_eq!(get_data_path(), PathBuf::from("data"));
            assert_eq!(get_config_path(), PathBuf::from("data").join("config.json"));
            assert_eq!(get_rules_path(), PathBuf::from("data").join("rules.json"));
        }
    }
}
