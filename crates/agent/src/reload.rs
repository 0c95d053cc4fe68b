use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use adapters::pool::static_address_pool::StaticAddressPool;
use application::config_reload::{ConfigReloadService, ReloadPlan};
use domain::common::entity::{Addr, AddressFamily};
use infrastructure::config::{AgentConfig, ConfigError};
use tokio_util::sync::CancellationToken;

/// Convert a validated configuration into what the engine applies.
pub fn reload_plan(config: &AgentConfig) -> Result<ReloadPlan, ConfigError> {
    let (main, anchors, default_action) = config.firewall_rules()?;
    Ok(ReloadPlan {
        main,
        anchors,
        default_action,
        tables: config.tables()?,
        timeouts: config.timeouts()?,
        limits: config.limits()?,
    })
}

/// Group configured interface addresses by interface.
pub fn addresses_by_interface(
    config: &AgentConfig,
) -> Result<HashMap<String, Vec<(AddressFamily, Addr)>>, ConfigError> {
    let mut by_if: HashMap<String, Vec<(AddressFamily, Addr)>> = HashMap::new();
    for (ifname, af, addr) in config.interface_addresses()? {
        by_if.entry(ifname).or_default().push((af, addr));
    }
    Ok(by_if)
}

/// Spawn a background task that re-reads the configuration on SIGHUP.
///
/// Returns the `JoinHandle` so the caller can await cleanup on shutdown.
pub fn spawn_reload_task(
    config_path: String,
    reload_service: Arc<ConfigReloadService>,
    pool: Arc<StaticAddressPool>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGHUP handler, reload disabled");
                    return;
                }
            };

        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = sighup.recv() => {
                        tracing::info!("SIGHUP received, reloading configuration");
                    }
                }
            }

            #[cfg(not(unix))]
            {
                cancel_token.cancelled().await;
                break;
            }

            if cancel_token.is_cancelled() {
                break;
            }

            perform_reload(&config_path, &reload_service, &pool).await;
        }
        tracing::info!("config reload task stopped");
    })
}

/// Perform a single reload: load YAML, convert to domain objects, apply.
///
/// Any failure keeps the running configuration. Returns whether the new
/// configuration was applied.
pub async fn perform_reload(
    config_path: &str,
    reload_service: &ConfigReloadService,
    pool: &StaticAddressPool,
) -> bool {
    // Phase 1: serde deserialization and validation
    let config = match AgentConfig::load(Path::new(config_path)) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "config reload rejected: invalid configuration");
            return false;
        }
    };

    // Phase 2: domain conversion
    let (plan, addresses) = match reload_plan(&config).and_then(|plan| {
        let addresses = addresses_by_interface(&config)?;
        Ok((plan, addresses))
    }) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(error = %e, "config reload rejected: conversion failed");
            return false;
        }
    };

    // Phase 3: apply
    if let Err(e) = reload_service.reload(plan).await {
        tracing::warn!(error = %e, "config reload failed at application level");
        return false;
    }

    for ifname in &config.agent.interfaces {
        if !addresses.contains_key(ifname) {
            pool.set_addresses(ifname, Vec::new());
        }
    }
    for (ifname, list) in addresses {
        pool.set_addresses(&ifname, list);
    }
    true
}
