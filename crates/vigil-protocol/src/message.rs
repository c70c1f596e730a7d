// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message envelope exchanged between a supervisor and its child processes.
//!
//! Every frame on a parent/child channel carries one [`IpcMessage`]. Health
//! checks are the only request/response pair; everything else is an event that
//! the receiving side republishes on its notification bus under `name`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Health check request sent from parent to child.
pub const SERVICE_HEALTH: &str = "Service.health";

/// Prefix shared by every health check reply.
pub const SERVICE_STATUS_PREFIX: &str = "Service.status.";

/// Health check passed; data is the probe result.
pub const SERVICE_STATUS_PASS: &str = "Service.status.pass";

/// Health check failed; data is a [`StatusFailure`].
pub const SERVICE_STATUS_FAIL: &str = "Service.status.fail";

/// One named message on an IPC channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Topic-like name (`Service.health`, `Camera.motion.start`, ...).
    pub name: String,
    /// Arbitrary payload.
    #[serde(default)]
    pub data: Value,
    /// Correlates a health check with its reply. Absent on plain events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl IpcMessage {
    /// Create an event message.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            id: None,
        }
    }

    /// Create a health check request carrying the child's time budget.
    pub fn health(id: u64, timeout_ms: u64) -> Self {
        Self {
            name: SERVICE_HEALTH.to_string(),
            data: json!({ "timeout": timeout_ms }),
            id: Some(id),
        }
    }

    /// Create a passing health check reply.
    pub fn pass(id: Option<u64>, result: Value) -> Self {
        Self {
            name: SERVICE_STATUS_PASS.to_string(),
            data: result,
            id,
        }
    }

    /// Create a failing health check reply.
    pub fn fail(id: Option<u64>, failure: &StatusFailure) -> Self {
        Self {
            name: SERVICE_STATUS_FAIL.to_string(),
            data: serde_json::to_value(failure).unwrap_or(Value::Null),
            id,
        }
    }

    /// True for `Service.status.*` replies.
    pub fn is_status(&self) -> bool {
        self.name.starts_with(SERVICE_STATUS_PREFIX)
    }

    /// Timeout budget of a `Service.health` request, in milliseconds.
    pub fn health_timeout_ms(&self) -> Option<u64> {
        self.data.get("timeout").and_then(Value::as_u64)
    }
}

/// Payload of `Service.status.fail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}
