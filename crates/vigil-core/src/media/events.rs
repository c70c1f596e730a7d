// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Media server event stream.
//!
//! The media server pushes `{type, payload}` frames. The router turns the
//! ones the platform cares about into bus notifications and completes
//! pending WebRTC offers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::bus::NotificationBus;
use crate::sync::lock;

/// One pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// How long an offer nobody asked for yet is kept.
pub const DEFAULT_OFFER_TTL: Duration = Duration::from_secs(10);

struct EarlyOffer {
    completed_at: Instant,
    offer: Value,
}

/// Publishes media server events on the bus.
pub struct MediaEventRouter {
    bus: Arc<NotificationBus>,
    publisher: String,
    offer_ttl: Duration,
    pending_sdps: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    early_sdps: Mutex<HashMap<String, EarlyOffer>>,
}

impl MediaEventRouter {
    pub fn new(bus: Arc<NotificationBus>, publisher: impl Into<String>) -> Self {
        Self {
            bus,
            publisher: publisher.into(),
            offer_ttl: DEFAULT_OFFER_TTL,
            pending_sdps: Mutex::new(HashMap::new()),
            early_sdps: Mutex::new(HashMap::new()),
        }
    }

    /// Keep unclaimed offers for `ttl`. Completions that arrive after their
    /// waiter gave up expire the same way.
    pub fn with_offer_ttl(mut self, ttl: Duration) -> Self {
        self.offer_ttl = ttl;
        self
    }

    /// Register interest in the completed offer of acceptor `protocol_id`.
    ///
    /// The receiver yields `{sdp, protocolId}`. An offer that completed before
    /// anyone asked is handed out immediately, unless it already expired.
    pub fn expect_sdp(&self, protocol_id: &Value) -> oneshot::Receiver<Value> {
        let key = sdp_key(protocol_id);
        let (tx, rx) = oneshot::channel();
        let early = lock(&self.early_sdps)
            .remove(&key)
            .filter(|early| early.completed_at.elapsed() < self.offer_ttl);
        match early {
            Some(early) => {
                let _ = tx.send(early.offer);
            }
            None => {
                lock(&self.pending_sdps).insert(key, tx);
            }
        }
        rx
    }

    /// Drop a pending offer nobody waits for any more.
    pub fn forget_sdp(&self, protocol_id: &Value) {
        let key = sdp_key(protocol_id);
        lock(&self.pending_sdps).remove(&key);
        lock(&self.early_sdps).remove(&key);
    }

    pub fn pending_sdps(&self) -> usize {
        lock(&self.pending_sdps).len()
    }

    /// Completed offers still waiting to be claimed.
    pub fn unclaimed_sdps(&self) -> usize {
        lock(&self.early_sdps).len()
    }

    pub async fn route(&self, event: MediaEvent) {
        trace!(kind = %event.kind, "media event");
        let payload = event.payload;

        match event.kind.as_str() {
            "inStreamCreated" | "inStreamClosed" => {
                let topic = format!("EMS.{}", event.kind);
                let name = payload
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.publish(&topic, payload.clone()).await;
                match name {
                    Some(name) => self.publish(&format!("{topic}.{name}"), payload).await,
                    None => warn!(kind = %event.kind, "stream event without a name"),
                }
            }
            "outStreamCreated" | "outStreamClosed" => {
                self.publish(&format!("EMS.{}", event.kind), payload).await;
            }
            "recordChunkClosed" => match segment(&payload) {
                Some(segment) => self.publish("EMS.newSegment", segment).await,
                None => warn!(?payload, "recordChunkClosed without clock data"),
            },
            "wrtcSDPChanged" => self.complete_sdp(&payload),
            other => debug!(kind = other, "ignoring media event"),
        }
    }

    fn complete_sdp(&self, payload: &Value) {
        if !payload
            .get("complete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return;
        }
        let Some(protocol_id) = payload.get("protocolId") else {
            warn!("completed SDP without protocolId");
            return;
        };

        let key = sdp_key(protocol_id);
        let offer = json!({
            "sdp": payload.get("sdp").cloned().unwrap_or(Value::Null),
            "protocolId": protocol_id,
        });

        let waiter = lock(&self.pending_sdps).remove(&key);
        match waiter {
            Some(tx) => {
                if tx.send(offer).is_err() {
                    debug!(protocol_id = %key, "SDP waiter went away");
                }
            }
            None => {
                let now = Instant::now();
                let mut early = lock(&self.early_sdps);
                early.retain(|_, e| now.duration_since(e.completed_at) < self.offer_ttl);
                early.insert(
                    key,
                    EarlyOffer {
                        completed_at: now,
                        offer,
                    },
                );
            }
        }
    }

    async fn publish(&self, topic: &str, payload: Value) {
        if let Err(e) = self
            .bus
            .publish(topic, vec![payload], Some(&self.publisher))
            .await
        {
            warn!(topic, error = %e, "media event handler failed");
        }
    }
}

fn sdp_key(protocol_id: &Value) -> String {
    match protocol_id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the `EMS.newSegment` payload from a `recordChunkClosed` event.
///
/// `start` is the wall-clock time of the segment's first sample:
/// `wallClock + segmentStartTs - (streamClock + streamClockBase)`.
fn segment(payload: &Value) -> Option<Value> {
    let clock = payload.get("clockSync")?;
    let number = |v: &Value, key: &str| v.get(key).and_then(Value::as_f64);

    let start = number(clock, "wallClock")? + number(payload, "segmentStartTs")?
        - (number(clock, "streamClock")? + number(clock, "streamClockBase")?);

    let mut segment = Map::new();
    segment.insert("start".into(), json!(start));
    segment.insert(
        "offset".into(),
        clock.get("segmentStartTs").cloned().unwrap_or(Value::Null),
    );
    segment.insert(
        "duration".into(),
        payload.get("segmentDuration").cloned().unwrap_or(Value::Null),
    );
    segment.insert(
        "file".into(),
        payload.get("file").cloned().unwrap_or(Value::Null),
    );

    // Custom parameters carry a one-character prefix
    if let Some(Value::Object(params)) = payload.get("customCLIParameters") {
        for (key, value) in params {
            let name: String = key.chars().skip(1).collect();
            segment.insert(name, value.clone());
        }
    }

    Some(Value::Object(segment))
}
