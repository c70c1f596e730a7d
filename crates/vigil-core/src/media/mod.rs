// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bridge between the bus and an external media server.
//!
//! The media server is supervised like any other process (usually a
//! [`ProcessService`](crate::process::ProcessService) sibling the bridge
//! depends on). The bridge talks to it two ways:
//!
//! - commands go out on the server's CLI port through a single-flight
//!   [`MediaCommandClient`];
//! - the server connects to the bridge's event port and pushes
//!   `{type, payload}` frames, which [`MediaEventRouter`] republishes.
//!
//! On the bus the bridge serves:
//!
//! | Topic | Argument | Response |
//! |-------|----------|----------|
//! | `EMS.getIngestPoint` | public stream name | private stream name |
//! | `EMS.startRecording` | `record` parameters | `configId` |
//! | `EMS.stopRecording` | `configId` | raw response |
//! | `EMS.createStreamAlias` | `{streamName, alias}` | alias data |
//! | `EMS.sdp.getOffer` | `{stunHost, turnHost, turnUsername, turnPassword}` | `{sdp, protocolId}` |
//! | `EMS.sdp.receiveAnswer` | `{answer, protocolId}` | raw response |

mod client;
mod events;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_protocol::{CommandClientConfig, CommandError, FrameError, FramedStream, TcpConnector};

use crate::bus::{Notification, handler};
use crate::service::{Service, ServiceNode};
use crate::sync::lock;

pub use client::{IceServers, MediaCommandClient};
pub use events::{DEFAULT_OFFER_TTL, MediaEvent, MediaEventRouter};

/// Errors from media server commands.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MediaError {
    #[error("media command failed: {0}")]
    Command(#[from] CommandError),

    #[error("media server rejected {command}: {description}")]
    Rejected { command: String, description: String },

    #[error("{command} response has no {field}")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    #[error("no SDP offer for acceptor {0} within {1}ms")]
    OfferTimeout(String, u64),

    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Where the media server listens and where the bridge listens.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Media server CLI address.
    pub cli_addr: String,
    /// Address the bridge accepts the event connection on.
    pub event_addr: String,
    pub command: CommandClientConfig,
    /// How long `EMS.sdp.getOffer` waits for the offer to complete.
    pub sdp_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cli_addr: "127.0.0.1:7777".to_string(),
            event_addr: "127.0.0.1:7778".to_string(),
            command: CommandClientConfig::default(),
            sdp_timeout: Duration::from_secs(10),
        }
    }
}

struct Listener {
    addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Service exposing the media server on the bus.
pub struct MediaBridge {
    name: String,
    config: MediaConfig,
    listener: Mutex<Option<Listener>>,
}

impl MediaBridge {
    pub fn new(name: impl Into<String>, config: MediaConfig) -> Self {
        Self {
            name: name.into(),
            config,
            listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Local address of the event listener while the bridge is running.
    pub fn event_addr(&self) -> Option<SocketAddr> {
        lock(&self.listener).as_ref().map(|l| l.addr)
    }
}

#[async_trait]
impl Service for MediaBridge {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn initialize(&self, node: &ServiceNode) -> anyhow::Result<()> {
        let client = Arc::new(MediaCommandClient::new(
            TcpConnector::new(self.config.cli_addr.clone()),
            self.config.command.clone(),
        ));
        let router = Arc::new(
            MediaEventRouter::new(node.bus().clone(), node.name())
                .with_offer_ttl(self.config.sdp_timeout),
        );

        let listener = TcpListener::bind(&self.config.event_addr).await?;
        let addr = listener.local_addr()?;
        info!(service = %self.name, %addr, "Media event listener bound");

        subscribe(node, "EMS.getIngestPoint", &client, get_ingest_point);
        subscribe(node, "EMS.startRecording", &client, start_recording);
        subscribe(node, "EMS.stopRecording", &client, stop_recording);
        subscribe(node, "EMS.createStreamAlias", &client, create_stream_alias);
        subscribe(node, "EMS.sdp.receiveAnswer", &client, receive_sdp_answer);

        let offers = router.clone();
        let sdp_timeout = self.config.sdp_timeout;
        subscribe(node, "EMS.sdp.getOffer", &client, move |client, n| {
            get_sdp_offer(client, offers.clone(), sdp_timeout, n)
        });

        let stop = CancellationToken::new();
        let task = tokio::spawn(serve_events(
            self.name.clone(),
            listener,
            router,
            stop.clone(),
        ));
        *lock(&self.listener) = Some(Listener { addr, stop, task });
        Ok(())
    }

    async fn destroy(&self, _node: &ServiceNode) -> anyhow::Result<()> {
        let listener = lock(&self.listener).take();
        if let Some(listener) = listener {
            listener.stop.cancel();
            if let Err(e) = listener.task.await {
                warn!(service = %self.name, error = %e, "media event listener panicked");
            }
        }
        Ok(())
    }
}

/// Subscribe a node-owned handler that gets the shared command client.
fn subscribe<F, Fut>(node: &ServiceNode, topic: &str, client: &Arc<MediaCommandClient>, f: F)
where
    F: Fn(Arc<MediaCommandClient>, Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    let client = client.clone();
    node.subscribe(topic, handler(move |n| f(client.clone(), n)));
}

async fn get_ingest_point(client: Arc<MediaCommandClient>, n: Notification) -> anyhow::Result<Value> {
    let stream = n
        .arg(0)
        .as_str()
        .ok_or_else(|| MediaError::BadRequest("stream name must be a string".into()))?;
    Ok(Value::String(client.create_ingest_point(stream).await?))
}

async fn start_recording(client: Arc<MediaCommandClient>, n: Notification) -> anyhow::Result<Value> {
    Ok(client.start_recording(n.arg(0).clone()).await?)
}

async fn stop_recording(client: Arc<MediaCommandClient>, n: Notification) -> anyhow::Result<Value> {
    Ok(client.stop_recording(n.arg(0).clone()).await?)
}

async fn create_stream_alias(
    client: Arc<MediaCommandClient>,
    n: Notification,
) -> anyhow::Result<Value> {
    let data = n.arg(0);
    let field = |name: &str| {
        data.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MediaError::BadRequest(format!("missing {name}")))
    };
    let (stream, alias) = (field("streamName")?, field("alias")?);
    Ok(client.create_stream_alias(&stream, &alias).await?)
}

async fn get_sdp_offer(
    client: Arc<MediaCommandClient>,
    router: Arc<MediaEventRouter>,
    timeout: Duration,
    n: Notification,
) -> anyhow::Result<Value> {
    let protocol_id = client
        .create_webrtc_acceptor(&IceServers::from_request(n.arg(0)))
        .await?;
    let offer = router.expect_sdp(&protocol_id);
    match tokio::time::timeout(timeout, offer).await {
        Ok(Ok(offer)) => Ok(offer),
        _ => {
            router.forget_sdp(&protocol_id);
            Err(MediaError::OfferTimeout(protocol_id.to_string(), timeout.as_millis() as u64).into())
        }
    }
}

async fn receive_sdp_answer(
    client: Arc<MediaCommandClient>,
    n: Notification,
) -> anyhow::Result<Value> {
    let data = n.arg(0);
    let protocol_id = data.get("protocolId").cloned().unwrap_or(Value::Null);
    let answer = data.get("answer").cloned().unwrap_or(Value::Null);
    Ok(client.send_sdp_answer(protocol_id, answer).await?)
}

async fn serve_events(
    service: String,
    listener: TcpListener,
    router: Arc<MediaEventRouter>,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(service = %service, %peer, "media server connected to event port");
                // One event connection at a time; a reconnect replaces it.
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = read_events(&service, stream, &router) => {}
                }
            }
            Err(e) => {
                warn!(service = %service, error = %e, "failed to accept media event connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!(service = %service, "media event listener stopped");
}

async fn read_events(service: &str, stream: TcpStream, router: &MediaEventRouter) {
    let mut framed = FramedStream::new(stream);
    loop {
        match framed.read_json::<MediaEvent>().await {
            Ok(event) => router.route(event).await,
            Err(FrameError::ConnectionClosed) => {
                debug!(service, "media event connection closed");
                return;
            }
            Err(FrameError::Json(e)) => {
                warn!(service, error = %e, "malformed media event");
            }
            Err(e) => {
                warn!(service, error = %e, "media event connection failed");
                return;
            }
        }
    }
}
