//! Platform drivers and their construction from `config.json`.

pub mod discord;
pub mod webhook;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::bridge::driver::Driver;
use crate::common::error::ConfigError;
use crate::config::types::Config;

use discord::{DiscordConfig, DiscordDriver};
use webhook::{WebhookConfig, WebhookDriver};

/// A constructed driver with its instance id.
pub struct DriverInstance {
    pub instance_id: String,
    pub driver: Arc<dyn Driver>,
}

fn typed_config<T: DeserializeOwned>(
    platform: &str,
    instance_id: &str,
    value: &Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(value.clone()).map_err(|e| ConfigError::InvalidValue {
        field: format!("{}.{}", platform, instance_id),
        message: e.to_string(),
    })
}

fn driver_error(platform: &str, instance_id: &str, e: anyhow::Error) -> ConfigError {
    ConfigError::InvalidValue {
        field: format!("{}.{}", platform, instance_id),
        message: format!("{:#}", e),
    }
}

/// Build every driver configured for a known platform.
///
/// Unknown platform sections are logged and skipped. A malformed section
/// for a known platform is a fatal config error.
pub fn build_drivers(config: &Config) -> Result<Vec<DriverInstance>, ConfigError> {
    let mut drivers = Vec::new();

    for (platform, instances) in &config.platforms {
        for (instance_id, value) in instances {
            let driver: Arc<dyn Driver> = match platform.as_str() {
                discord::PLATFORM => {
                    let cfg: DiscordConfig = typed_config(platform, instance_id, value)?;
                    cfg.validate(instance_id)?;
                    Arc::new(
                        DiscordDriver::new(instance_id, cfg)
                            .map_err(|e| driver_error(platform, instance_id, e))?,
                    )
                }
                webhook::PLATFORM => {
                    let cfg: WebhookConfig = typed_config(platform, instance_id, value)?;
                    Arc::new(
                        WebhookDriver::new(instance_id, cfg)
                            .map_err(|e| driver_error(platform, instance_id, e))?,
                    )
                }
                other => {
                    warn!(
                        platform = other,
                        instance = %instance_id,
                        "Unknown platform, instance ignored"
                    );
                    continue;
                }
            };
            drivers.push(DriverInstance {
                instance_id: instance_id.clone(),
                driver,
            });
        }
    }

    Ok(drivers)
}
