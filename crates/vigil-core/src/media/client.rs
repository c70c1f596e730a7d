// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed command helpers for the media server's CLI port.

use std::collections::HashMap;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;
use vigil_protocol::{CommandClient, CommandClientConfig, Connector};

use super::MediaError;

/// STUN/TURN servers handed to a new WebRTC acceptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServers {
    pub stun_host: Option<String>,
    pub turn_host: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
}

impl IceServers {
    /// Read the `stunHost`, `turnHost`, `turnUsername` and `turnPassword`
    /// fields of a request payload.
    pub fn from_request(data: &Value) -> Self {
        let field = |name: &str| data.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            stun_host: field("stunHost"),
            turn_host: field("turnHost"),
            turn_username: field("turnUsername"),
            turn_password: field("turnPassword"),
        }
    }
}

/// Client for the media server's command interface.
///
/// Every exchange is a `{command, parameters}` frame answered by exactly one
/// frame. Requests share one connection and go out strictly one at a time.
pub struct MediaCommandClient {
    client: CommandClient,
    ingest_points: Mutex<HashMap<String, String>>,
}

impl MediaCommandClient {
    pub fn new<C: Connector>(connector: C, config: CommandClientConfig) -> Self {
        Self {
            client: CommandClient::new(connector, config),
            ingest_points: Mutex::new(HashMap::new()),
        }
    }

    /// Send one raw command and return the whole response document.
    pub async fn cli_request(&self, command: &str, parameters: Value) -> Result<Value, MediaError> {
        debug!(command, "media command");
        let response = self
            .client
            .request(json!({ "command": command, "parameters": parameters }))
            .await?;
        Ok(response)
    }

    /// Like [`cli_request`](Self::cli_request) but a `FAIL` status is an error.
    async fn checked(&self, command: &str, parameters: Value) -> Result<Value, MediaError> {
        let response = self.cli_request(command, parameters).await?;
        if response.get("status").and_then(Value::as_str) == Some("FAIL") {
            let description = response
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description")
                .to_string();
            return Err(MediaError::Rejected {
                command: command.to_string(),
                description,
            });
        }
        Ok(response)
    }

    /// Private stream name publishers push `stream` to. Created once per
    /// public name and cached.
    pub async fn create_ingest_point(&self, stream: &str) -> Result<String, MediaError> {
        let mut points = self.ingest_points.lock().await;
        if let Some(private) = points.get(stream) {
            return Ok(private.clone());
        }

        let mut private = uuid::Uuid::new_v4().simple().to_string();
        private.truncate(16);
        self.checked(
            "createIngestPoint",
            json!({ "privateStreamName": private, "publicStreamName": stream }),
        )
        .await?;

        points.insert(stream.to_string(), private.clone());
        Ok(private)
    }

    /// Start a recording described by `parameters`; returns its `configId`.
    pub async fn start_recording(&self, parameters: Value) -> Result<Value, MediaError> {
        let response = self.checked("record", parameters).await?;
        response
            .pointer("/data/configId")
            .cloned()
            .ok_or(MediaError::MissingField {
                command: "record",
                field: "configId",
            })
    }

    /// Remove a recording config for good.
    pub async fn stop_recording(&self, config_id: Value) -> Result<Value, MediaError> {
        self.cli_request("removeConfig", json!({ "id": config_id, "permanently": 1 }))
            .await
    }

    pub async fn create_stream_alias(&self, stream: &str, alias: &str) -> Result<Value, MediaError> {
        let response = self
            .checked(
                "addStreamAlias",
                json!({ "localStreamName": stream, "aliasName": alias }),
            )
            .await?;
        Ok(response.get("data").cloned().unwrap_or(Value::Null))
    }

    pub async fn remove_stream_alias(&self, alias: &str) -> Result<Value, MediaError> {
        self.cli_request("removeStreamAlias", json!({ "aliasName": alias }))
            .await
    }

    /// Create a WebRTC acceptor and return its `protocolId`. The SDP offer
    /// arrives later as a `wrtcSDPChanged` event.
    pub async fn create_webrtc_acceptor(&self, servers: &IceServers) -> Result<Value, MediaError> {
        let response = self
            .checked(
                "createWrtcAcceptor",
                json!({
                    "stunServerAddress": servers.stun_host,
                    "turnServerAddress": servers.turn_host.clone().unwrap_or_default(),
                    "turnUsername": servers.turn_username.clone().unwrap_or_default(),
                    "turnPassword": servers.turn_password.clone().unwrap_or_default(),
                }),
            )
            .await?;
        response
            .pointer("/data/protocolId")
            .cloned()
            .ok_or(MediaError::MissingField {
                command: "createWrtcAcceptor",
                field: "protocolId",
            })
    }

    pub async fn send_sdp_answer(&self, protocol_id: Value, answer: Value) -> Result<Value, MediaError> {
        self.checked(
            "wrtcSdpAnswer",
            json!({ "sdpAnswer": answer, "protocolId": protocol_id }),
        )
        .await
    }
}
