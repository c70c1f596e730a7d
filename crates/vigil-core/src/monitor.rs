// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic health monitor for a service tree.
//!
//! Every `interval` the monitor runs `check_health(timeout)` on the root. A
//! failure that no `recover` hook handled is an unhandled error for the whole
//! process: under [`FailurePolicy::Restart`] the monitor stops and restarts
//! the root once, and a failure of that restart ends the monitor with the
//! error. Under [`FailurePolicy::Log`] failures are only logged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::service::ServiceNode;

/// What to do with a health failure nobody recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Log,
    Restart,
}

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often to check the tree.
    pub interval: Duration,
    /// Budget handed to `check_health`.
    pub timeout: Duration,
    pub on_failure: FailurePolicy,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            timeout: Duration::from_millis(3000),
            on_failure: FailurePolicy::Restart,
        }
    }
}

/// Background worker that probes a service tree.
pub struct HealthMonitor {
    root: Arc<ServiceNode>,
    config: HealthMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    pub fn new(root: Arc<ServiceNode>, config: HealthMonitorConfig) -> Self {
        Self {
            root,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled or recovery fails.
    pub async fn run(&self) -> Result<()> {
        info!(
            service = %self.root.name(),
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.check().await {
                        error!(service = %self.root.name(), error = %e, "Recovery failed");
                        return Err(e);
                    }
                }
            }
        }

        info!("Health monitor stopped");
        Ok(())
    }

    /// One health pass, including recovery under the restart policy.
    pub async fn check(&self) -> Result<()> {
        let error = match self.root.check_health(self.config.timeout).await {
            Ok(()) => {
                debug!(service = %self.root.name(), "Health check passed");
                return Ok(());
            }
            Err(e) => e,
        };

        match self.config.on_failure {
            FailurePolicy::Log => {
                warn!(service = %self.root.name(), error = %error, "Health check failed");
                Ok(())
            }
            FailurePolicy::Restart => recover_root(&self.root, error).await,
        }
    }
}

/// Full stop/start of `root` after an unhandled error. Fails if the restart
/// fails.
pub async fn recover_root(root: &ServiceNode, error: Error) -> Result<()> {
    error!(service = %root.name(), error = %error, "Unhandled error, restarting service tree");
    root.restart().await?;
    info!(service = %root.name(), "Service tree restarted");
    Ok(())
}
