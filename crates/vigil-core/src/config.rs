// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for vigil.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON manifest describing the supervised tree
    pub manifest: Option<PathBuf>,
    /// Directory for IPC socket files
    pub run_dir: PathBuf,
    /// Period of the root health monitor
    pub health_check_interval: Duration,
    /// Budget of each root health check
    pub health_check_timeout: Duration,
    /// How long a channel child has to connect back
    pub ipc_connect_timeout: Duration,
    /// SIGTERM-to-SIGKILL grace period on stop
    pub stop_grace: Duration,
    /// Delay between spawning a child and initializing it
    pub spawn_settle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest: None,
            run_dir: PathBuf::from(".run"),
            health_check_interval: Duration::from_millis(5000),
            health_check_timeout: Duration::from_millis(3000),
            ipc_connect_timeout: Duration::from_millis(5000),
            stop_grace: Duration::from_millis(2000),
            spawn_settle: Duration::from_millis(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let millis = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
            }
        };

        Ok(Self {
            manifest: lookup("VIGIL_MANIFEST").map(PathBuf::from),
            run_dir: lookup("VIGIL_RUN_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.run_dir),
            health_check_interval: millis(
                "VIGIL_HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval,
            )?,
            health_check_timeout: millis(
                "VIGIL_HEALTH_CHECK_TIMEOUT_MS",
                defaults.health_check_timeout,
            )?,
            ipc_connect_timeout: millis(
                "VIGIL_IPC_CONNECT_TIMEOUT_MS",
                defaults.ipc_connect_timeout,
            )?,
            stop_grace: millis("VIGIL_STOP_GRACE_MS", defaults.stop_grace)?,
            spawn_settle: millis("VIGIL_SPAWN_SETTLE_MS", defaults.spawn_settle)?,
        })
    }

    /// The manifest path, which the supervisor binary requires.
    pub fn require_manifest(&self) -> Result<&Path, ConfigError> {
        self.manifest
            .as_deref()
            .ok_or(ConfigError::MissingEnvVar("VIGIL_MANIFEST"))
    }

    pub fn with_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest = Some(path.into());
        self
    }

    pub fn with_run_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_dir = path.into();
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_ipc_connect_timeout(mut self, timeout: Duration) -> Self {
        self.ipc_connect_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_spawn_settle(mut self, settle: Duration) -> Self {
        self.spawn_settle = settle;
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable holds something other than a millisecond count.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}
