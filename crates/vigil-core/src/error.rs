// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vigil-core.
//!
//! [`Error`] is `Clone` because a single start outcome is shared by every
//! caller awaiting the same `start()`. Foreign errors are held behind `Arc`.

use std::sync::Arc;

use thiserror::Error;
use vigil_protocol::{CommandError, FrameError};

/// Supervision errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid tree assembly (duplicate child name, bad dependency declaration).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A declared dependency is not a sibling of the dependent service.
    #[error("Dependency {dependency} is not a sibling of {service}")]
    UnresolvedDependency {
        /// Service declaring the dependency.
        service: String,
        /// Name that could not be resolved.
        dependency: String,
    },

    /// Sibling dependencies form a cycle.
    #[error("Dependency cycle among children of {parent}: {}", .cycle.join(" -> "))]
    DependencyCycle {
        /// Parent whose children are involved.
        parent: String,
        /// Services on the cycle, first one repeated at the end.
        cycle: Vec<String>,
    },

    /// The operation needs a running service or process.
    #[error("{0} has not yet been started")]
    NotStarted(String),

    /// A health probe did not answer within its budget.
    #[error("Health check for {service} timed out after {timeout_ms}ms")]
    HealthCheckTimeout {
        /// Service being probed.
        service: String,
        /// Budget that was exceeded.
        timeout_ms: u64,
    },

    /// A child process reported a failing health check.
    #[error("Health check for {service} failed: {message}")]
    HealthCheckFailed {
        /// Service being probed.
        service: String,
        /// Failure message reported by the probe.
        message: String,
        /// Optional stack/backtrace text reported by the probe.
        stack: Option<String>,
    },

    /// A supervised process is no longer running.
    #[error("Process {service} exited: {status}")]
    ProcessExit {
        /// Service owning the process.
        service: String,
        /// Exit status description.
        status: String,
    },

    /// Spawning a child process failed.
    #[error("Failed to spawn {service}: {error}")]
    Spawn {
        /// Service owning the process.
        service: String,
        /// Underlying I/O error.
        error: Arc<std::io::Error>,
    },

    /// A frame could not be decoded or reassembled.
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(Arc<FrameError>),

    /// A command to an external process failed.
    #[error("Command error: {0}")]
    Command(Arc<CommandError>),

    /// `restart()` was called while another restart was running.
    #[error("Restart of {0} already in progress")]
    RestartInProgress(String),

    /// A service hook (initialize, destroy, health) failed.
    #[error("{service} {hook} failed: {error:#}")]
    Hook {
        /// Service whose hook failed.
        service: String,
        /// Hook name.
        hook: &'static str,
        /// Error returned by the hook.
        error: Arc<anyhow::Error>,
    },

    /// A notification handler failed.
    #[error("Handler for {topic} failed: {error:#}")]
    Handler {
        /// Topic being dispatched.
        topic: String,
        /// Error returned by the handler.
        error: Arc<anyhow::Error>,
    },

    /// An IPC channel closed while a message was in flight.
    #[error("Channel to {0} closed")]
    ChannelClosed(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::ProtocolFraming(Arc::new(e))
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Frame(frame) => Error::ProtocolFraming(Arc::new(frame)),
            other => Error::Command(Arc::new(other)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(Arc::new(e))
    }
}

impl Error {
    /// Wrap a failed service hook.
    ///
    /// A hook that already failed with a vigil [`Error`] keeps it as is, so
    /// typed failures such as [`Error::HealthCheckTimeout`] survive the trip
    /// through `anyhow`.
    pub fn hook(service: impl Into<String>, hook: &'static str, error: anyhow::Error) -> Self {
        match error.downcast::<Error>() {
            Ok(inner) => inner,
            Err(error) => Error::Hook {
                service: service.into(),
                hook,
                error: Arc::new(error),
            },
        }
    }

    /// True for failures that came out of a health probe.
    pub fn is_health_failure(&self) -> bool {
        matches!(
            self,
            Error::HealthCheckTimeout { .. }
                | Error::HealthCheckFailed { .. }
                | Error::Hook { hook: "health", .. }
        )
    }
}

/// Result type using vigil Error.
pub type Result<T> = std::result::Result<T, Error>;
