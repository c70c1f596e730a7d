// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vigil Core - Service Supervision for the camera platform
//!
//! This crate hosts every long-running part of the platform as a tree of
//! supervised services. Services talk to each other over a process-wide
//! notification bus, and services that live in other OS processes are
//! spawned, health-checked and restarted by a process supervisor.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       vigil (supervisor binary)                          │
//! │                 Config + Manifest → Runtime + HealthMonitor              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ServiceNode tree                                 │
//! │     ordered start · layered stop · cascading health · restart           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           │ publish/subscribe                            │ spawn / IPC
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │   NotificationBus     │◄───── events ──────│  ProcessService children    │
//! │  priority chains      │                    │  (ChildRuntime inside)      │
//! └───────────────────────┘                    └─────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! | Operation | Semantics |
//! |-----------|-----------|
//! | `start` | dependencies first, then `initialize`, then children concurrently; idempotent |
//! | `stop` | dependents before dependencies, layer by layer, then `destroy` |
//! | `check_health` | own probe plus every child's, bounded by a timeout |
//! | `restart` | `stop` then `start`; concurrent restarts are rejected |
//!
//! Failures travel up the tree: each ancestor's `recover` hook may handle
//! them, and an error that reaches the root unhandled triggers one full
//! restart of the tree.
//!
//! # Processes
//!
//! [`ProcessService`] supervises an external program. With
//! [`Method::Pipes`](process::Method::Pipes) its output is logged and health
//! is a liveness check. With [`Method::Channel`](process::Method::Channel)
//! the child runs a [`ChildRuntime`](child::ChildRuntime), connects back over
//! a Unix socket and answers framed health requests itself.

/// Process-wide topic-based notification bus.
pub mod bus;

/// Runtime for service trees running inside a supervised child process.
pub mod child;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types shared by the engine, the supervisor and the runtimes.
pub mod error;

/// JSON manifest describing a tree of supervised processes.
pub mod manifest;

/// Bus bridge for an external media server.
pub mod media;

/// Periodic health checks over a service tree.
pub mod monitor;

/// Supervision of external OS processes.
pub mod process;

/// Embeddable runtime owning a service tree.
pub mod runtime;

/// Service trait, tree nodes and the lifecycle engine.
pub mod service;

mod sync;

pub use bus::{Handler, Notification, NotificationBus, NotificationStatus, SubscriptionId, handler};
pub use config::Config;
pub use error::{Error, Result};
pub use process::{ProcessArgs, ProcessService, ProcessSpec};
pub use runtime::{Runtime, RuntimeBuilder};
pub use service::{Dep, Group, Service, ServiceNode, ServiceState};
