// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service tree and lifecycle engine.
//!
//! A [`ServiceNode`] wraps one [`Service`] implementation and owns its
//! children. The node runs the lifecycle algorithms (ordered start, reverse
//! ordered stop, cascading health checks, restart) and calls into the service
//! through the hooks of the [`Service`] trait.
//!
//! ```text
//!                 root
//!               /      \
//!        media-bridge  recorder ──depends on──▶ media-bridge
//! ```
//!
//! Dependencies are always siblings (or explicitly supplied nodes). A node's
//! dependencies reach [`ServiceState::Running`] before its own `initialize`
//! hook runs, and its own `initialize` completes before any child starts.

mod deps;
mod node;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;

pub use deps::Dep;
pub use node::ServiceNode;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Terminal until an explicit `restart()`.
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Customisation points of a supervised service.
///
/// Every hook has a default, so a plain grouping node is just
/// `struct Group; impl Service for Group {}`. Hooks receive the node they are
/// attached to, which gives them access to the bus (node-owned subscriptions
/// are released automatically on stop) and to the tree.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Identifier, unique among siblings. Defaults to the type name.
    fn name(&self) -> String {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Suppress the "starting" log line (and child output forwarding for
    /// process services).
    fn silent(&self) -> bool {
        false
    }

    /// Message logged when the service starts.
    fn start_message(&self) -> String {
        format!("Starting {}...", self.name())
    }

    async fn initialize(&self, _node: &ServiceNode) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&self, _node: &ServiceNode) -> anyhow::Result<()> {
        Ok(())
    }

    /// Health probe. The engine enforces `timeout` around this call; the
    /// budget is passed in for probes that forward it elsewhere.
    async fn health(&self, _node: &ServiceNode, _timeout: Duration) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    /// Called with a failure from this node's subtree. Return `true` to mark
    /// it handled; anything else rethrows.
    async fn recover(&self, _node: &ServiceNode, _error: &Error) -> bool {
        false
    }
}

/// Named node with no behaviour of its own, used to group children.
#[derive(Debug, Clone)]
pub struct Group {
    name: String,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Service for Group {
    fn name(&self) -> String {
        self.name.clone()
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder;
    impl Service for Recorder {}

    mod nested {
        pub struct Generic<T>(pub T);
        impl<T: Send + Sync + 'static> crate::service::Service for Generic<T> {}
    }

    #[test]
    fn test_default_name_is_short_type_name() {
        assert_eq!(Recorder.name(), "Recorder");
        assert_eq!(nested::Generic(1u8).name(), "Generic");
    }

    #[test]
    fn test_default_start_message() {
        assert_eq!(Recorder.start_message(), "Starting Recorder...");
    }

    #[test]
    fn test_group_uses_given_name() {
        assert_eq!(Group::new("cameras").name(), "cameras");
    }
}
