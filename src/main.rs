//! NextBridge - multi-protocol chat bridge
//!
//! Relays messages and attachments between chat platforms according to
//! routing rules, re-rendering each message for its destination.

mod bridge;
mod common;
mod config;
mod drivers;
mod media;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use bridge::{CoordinatorBuilder, CredentialRegistry, DispatchSettings, RuleEngine};
use common::reconnect::{run_with_reconnect, ReconnectPolicy};
use config::env::{get_config_path, get_rules_path};
use config::validate::unknown_instances;
use config::{load_config, load_rules};
use media::MediaFetcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("NextBridge v{} starting...", env!("CARGO_PKG_VERSION"));

    // ============================================================
    // Configuration
    // ============================================================
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path.display());
    let config = load_config(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is valid JSON.", config_path.display());
        e
    })?;

    for (platform, instance) in config.instances() {
        debug!(platform, instance, "Configured instance");
    }

    let credentials = CredentialRegistry::from_config(&config.raw);
    if credentials.is_empty() {
        warn!("No sensitive values found in config, leak detection is inactive");
    } else {
        info!(
            "Loaded {} sensitive value(s) for leak detection",
            credentials.len()
        );
    }

    let rules_path = get_rules_path();
    info!("Loading rules from {}...", rules_path.display());
    let rules = load_rules(&rules_path).map_err(|e| {
        error!("Failed to load rules: {}", e);
        e
    })?;
    for instance in unknown_instances(&rules, &config) {
        warn!(
            instance = %instance,
            "Rule references an instance missing from config.json"
        );
    }

    let engine = RuleEngine::new(rules);
    if engine.is_empty() {
        warn!("No rules loaded, messages will not be relayed");
    } else {
        info!("  Rules: {}", engine.len());
    }

    let drivers = drivers::build_drivers(&config)?;
    if drivers.is_empty() {
        warn!("No drivers configured, nothing will be bridged");
    }

    // ============================================================
    // Coordinator
    // ============================================================
    let settings = &config.bridge;
    let mut builder = CoordinatorBuilder::new(engine, credentials)
        .with_fetcher(MediaFetcher::new(
            settings.head_timeout(),
            settings.fetch_timeout(),
        ))
        .with_settings(DispatchSettings::from(settings));
    for instance in &drivers {
        builder = builder.register(instance.instance_id.clone(), Arc::clone(&instance.driver));
    }
    let coordinator = builder.build();
    let registered: Vec<&str> = coordinator.instances().collect();
    info!("Registered instances: {}", registered.join(", "));

    // ============================================================
    // Listen loops, one per driver
    // ============================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let policy = ReconnectPolicy::default();

    let mut tasks = Vec::with_capacity(drivers.len());
    for instance in drivers {
        let coordinator = Arc::clone(&coordinator);
        let shutdown_rx = shutdown_rx.clone();
        let policy = policy.clone();

        tasks.push(tokio::spawn(async move {
            let name = instance.instance_id;
            let driver = instance.driver;
            let listen_rx = shutdown_rx.clone();
            run_with_reconnect(&name, &policy, shutdown_rx, || {
                driver.listen(Arc::clone(&coordinator), listen_rx.clone())
            })
            .await;
            debug!(driver = %name, "Driver task ended");
        }));
    }

    info!("Bridge running with {} driver(s)", tasks.len());
    shutdown_signal().await;
    info!("Shutdown signal received - stopping drivers...");

    if let Err(e) = shutdown_tx.send(true) {
        debug!("Shutdown channel closed (all drivers already exited): {}", e);
    }

    let timeout = Duration::from_secs(5);
    let all = futures::future::join_all(tasks);
    match tokio::time::timeout(timeout, all).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    warn!("Driver task panicked: {}", e);
                }
            }
            info!("All drivers stopped");
        }
        Err(_) => warn!("Driver shutdown timed out"),
    }

    info!("Exiting...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
