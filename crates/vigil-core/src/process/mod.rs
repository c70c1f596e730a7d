// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervision of external OS processes.
//!
//! A [`ProcessService`] is a [`Service`](crate::service::Service) whose
//! `initialize` spawns a program and whose `destroy` terminates it. Two
//! transports are supported:
//!
//! - [`Method::Pipes`]: stdout/stderr are piped into the log; health is a
//!   liveness check on the pid.
//! - [`Method::Channel`]: the child connects back over a Unix socket whose
//!   path is exported as [`IPC_SOCKET_ENV`]; health checks and events travel
//!   as framed [`IpcMessage`](vigil_protocol::IpcMessage)s.
//!
//! Unexpected exits are turned into a message for a small state machine that
//! either restarts the node or leaves it stopped, depending on the
//! [`ExitPolicy`].

mod args;
mod channel;
mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;

pub use args::ProcessArgs;
pub use channel::HEALTH_TIMEOUT_MARGIN;
pub use supervisor::{ProcessPhase, ProcessService};

/// Environment variable carrying the channel socket path to the child.
pub const IPC_SOCKET_ENV: &str = "VIGIL_IPC_SOCKET";

/// How the supervisor talks to the child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Independent process with piped standard streams.
    #[default]
    Pipes,
    /// Process connected back over a structured message channel.
    Channel,
}

/// What happens when the child exits without being asked to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExitPolicy {
    #[default]
    AutoRestart,
    Manual,
}

/// Description of one supervised program.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: ProcessArgs,
    pub method: Method,
    pub exit_policy: ExitPolicy,
    pub env: Vec<(String, String)>,
    pub silent: bool,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: ProcessArgs::None,
            method: Method::default(),
            exit_policy: ExitPolicy::default(),
            env: Vec::new(),
            silent: false,
        }
    }

    pub fn args(mut self, args: impl Into<ProcessArgs>) -> Self {
        self.args = args.into();
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn exit_policy(mut self, policy: ExitPolicy) -> Self {
        self.exit_policy = policy;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

/// Timing and placement knobs shared by every supervised process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory for channel socket files.
    pub run_dir: PathBuf,
    /// How long a channel child has to connect back.
    pub connect_timeout: Duration,
    /// SIGTERM-to-SIGKILL grace period.
    pub stop_grace: Duration,
    /// Delay between spawning and reporting the process as started.
    pub spawn_settle: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(".run"),
            connect_timeout: Duration::from_millis(5000),
            stop_grace: Duration::from_millis(2000),
            spawn_settle: Duration::from_millis(30),
        }
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            run_dir: config.run_dir.clone(),
            connect_timeout: config.ipc_connect_timeout,
            stop_grace: config.stop_grace,
            spawn_settle: config.spawn_settle,
        }
    }
}
