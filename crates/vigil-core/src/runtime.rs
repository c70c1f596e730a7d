// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime that owns a service tree.
//!
//! [`Runtime`] starts the root node, runs the periodic health monitor and
//! tears everything down on shutdown. An unhandled error (a failed start or a
//! health failure no `recover` hook handled) triggers one full stop/start of
//! the root; if that fails too the error is fatal and is returned from
//! [`Runtime::start`] or [`Runtime::wait`].
//!
//! ```rust,ignore
//! use vigil_core::{Config, NotificationBus, Runtime, manifest::Manifest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let bus = NotificationBus::new();
//!     let root = Manifest::from_path("tree.json")?.build(bus, &(&config).into())?;
//!
//!     let mut runtime = Runtime::builder()
//!         .root(root)
//!         .config(&config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::select! {
//!         _ = tokio::signal::ctrl_c() => {}
//!         result = runtime.wait() => result?,
//!     }
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::monitor::{FailurePolicy, HealthMonitor, HealthMonitorConfig, recover_root};
use crate::service::ServiceNode;

/// Builder for creating a [`Runtime`].
pub struct RuntimeBuilder {
    root: Option<Arc<ServiceNode>>,
    health_check_interval: Duration,
    health_check_timeout: Duration,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        let defaults = HealthMonitorConfig::default();
        Self {
            root: None,
            health_check_interval: defaults.interval,
            health_check_timeout: defaults.timeout,
        }
    }
}

impl RuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root of the service tree (required).
    pub fn root(mut self, root: Arc<ServiceNode>) -> Self {
        self.root = Some(root);
        self
    }

    /// Take the health monitor settings from `config`.
    pub fn config(self, config: &Config) -> Self {
        self.health_check_interval(config.health_check_interval)
            .health_check_timeout(config.health_check_timeout)
    }

    /// Set the health monitor period.
    ///
    /// Default: 5 seconds
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the budget of each health check.
    ///
    /// Default: 3 seconds
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<Runtime> {
        let root = self
            .root
            .ok_or_else(|| Error::Configuration("runtime needs a root service".to_string()))?;

        Ok(Runtime {
            root,
            monitor_config: HealthMonitorConfig {
                interval: self.health_check_interval,
                timeout: self.health_check_timeout,
                on_failure: FailurePolicy::Restart,
            },
            shutdown: None,
            monitor: None,
        })
    }
}

/// A running service tree.
pub struct Runtime {
    root: Arc<ServiceNode>,
    monitor_config: HealthMonitorConfig,
    shutdown: Option<Arc<Notify>>,
    monitor: Option<JoinHandle<Result<()>>>,
}

impl Runtime {
    /// Create a new runtime builder.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn root(&self) -> &Arc<ServiceNode> {
        &self.root
    }

    /// Start the tree and the health monitor.
    pub async fn start(mut self) -> Result<Self> {
        info!(service = %self.root.name(), "Starting service tree");

        if let Err(e) = self.root.start().await {
            recover_root(&self.root, e).await?;
        }

        let monitor = HealthMonitor::new(self.root.clone(), self.monitor_config.clone());
        self.shutdown = Some(monitor.shutdown_handle());
        self.monitor = Some(tokio::spawn(async move { monitor.run().await }));

        info!(service = %self.root.name(), "Service tree running");
        Ok(self)
    }

    /// Handle an error nothing in the tree recovered from: stop and start the
    /// whole tree once. A failure of that restart is returned as fatal.
    pub async fn recover(&self, error: Error) -> Result<()> {
        recover_root(&self.root, error).await
    }

    /// Resolve when the health monitor ends with a fatal error.
    ///
    /// Never resolves while the tree is healthy or recoverable.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(monitor) = self.monitor.as_mut() else {
            return std::future::pending().await;
        };

        let outcome = monitor.await;
        self.monitor = None;
        match outcome {
            Ok(result) => result,
            Err(e) => Err(Error::Io(Arc::new(std::io::Error::other(format!(
                "health monitor task failed: {e}"
            ))))),
        }
    }

    /// Stop the monitor, then the tree, then drop every bus chain.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.notify_one();
        }
        if let Some(monitor) = self.monitor.take() {
            match monitor.await {
                Ok(Err(e)) => warn!(error = %e, "health monitor ended with an error"),
                Err(e) => warn!(error = %e, "health monitor task failed"),
                Ok(Ok(())) => {}
            }
        }

        info!(service = %self.root.name(), "Stopping service tree");
        let result = self.root.stop().await;
        self.root.bus().clear();
        result
    }
}
