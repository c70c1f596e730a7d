// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vigil - supervisor for the camera platform's processes
//!
//! Loads a JSON manifest (`VIGIL_MANIFEST`), builds one supervised process
//! per entry and keeps the tree healthy until Ctrl-C.

use anyhow::Result;
use tracing::{error, info};

use vigil_core::config::Config;
use vigil_core::manifest::Manifest;
use vigil_core::{NotificationBus, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vigil=info,vigil_core=info")),
        )
        .init();

    info!("Starting Vigil");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let manifest_path = config.require_manifest()?.to_path_buf();

    info!(
        manifest = %manifest_path.display(),
        run_dir = %config.run_dir.display(),
        health_check_interval_ms = config.health_check_interval.as_millis() as u64,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.run_dir)?;

    let manifest = Manifest::from_path(&manifest_path)?;
    info!(name = %manifest.name, services = manifest.services.len(), "Manifest loaded");

    let bus = NotificationBus::new();
    let root = manifest.build(bus, &(&config).into())?;

    let mut runtime = Runtime::builder()
        .root(root)
        .config(&config)
        .build()?
        .start()
        .await?;

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            signal.map_err(anyhow::Error::from)
        }
        result = runtime.wait() => {
            if let Err(e) = &result {
                error!(error = %e, "Service tree could not be recovered");
            }
            result.map_err(anyhow::Error::from)
        }
    };

    runtime.shutdown().await?;
    info!("Shutdown complete");

    outcome
}
