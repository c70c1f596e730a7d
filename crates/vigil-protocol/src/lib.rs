// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vigil Protocol - length-prefixed framing for supervisor IPC
//!
//! This crate provides the wire protocol used between:
//! - A supervisor and the child processes it spawned (health checks, events)
//! - A service and a long-lived external process it drives by command
//!   (request/response plus pushed events)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     vigil-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Commands: single-flight FIFO request/response              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelope: IpcMessage { name, data, id } as JSON            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: u32 big-endian length + payload                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: any AsyncRead + AsyncWrite (Unix socket, TCP)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vigil_protocol::{CommandClient, CommandClientConfig, TcpConnector};
//!
//! let client = CommandClient::new(
//!     TcpConnector::new("127.0.0.1:7777"),
//!     CommandClientConfig::default(),
//! );
//! let response = client
//!     .request(serde_json::json!({"command": "version", "parameters": {}}))
//!     .await?;
//! ```

pub mod command;
pub mod frame;
pub mod message;

pub use command::{CommandClient, CommandClientConfig, CommandError, Connector, TcpConnector};
pub use frame::{Frame, FrameDecoder, FrameError, FramedStream, read_frame, write_frame};
pub use message::{
    IpcMessage, SERVICE_HEALTH, SERVICE_STATUS_FAIL, SERVICE_STATUS_PASS, SERVICE_STATUS_PREFIX,
    StatusFailure,
};
