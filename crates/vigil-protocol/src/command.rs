// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-flight command client for long-lived subprocesses.
//!
//! A [`CommandClient`] owns one connection and one worker task. Requests are
//! pushed onto a FIFO queue and the worker executes them strictly one at a
//! time: write the request frame, read exactly one response frame, hand the
//! result back to the caller. Two overlapping callers therefore complete in
//! issuance order and never interleave on the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::frame::{FrameError, FramedStream};

/// Errors that can occur while executing a command
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandError {
    #[error("connect error: {0}")]
    Connect(std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("command client has shut down")]
    Closed,
}

/// Configuration for a command client
#[derive(Debug, Clone)]
pub struct CommandClientConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Time allowed for one request/response exchange in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for CommandClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// Opens the byte stream a [`CommandClient`] talks over.
///
/// The client reconnects lazily: the first request (and the first request
/// after a failed exchange) calls `connect` again.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Stream type produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new connection.
    async fn connect(&self) -> std::io::Result<Self::Stream>;
}

/// Connects over TCP to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect(&self.addr).await
    }
}

struct QueuedRequest {
    payload: Value,
    reply: oneshot::Sender<Result<Value, CommandError>>,
}

/// FIFO request queue in front of one connection.
#[derive(Clone)]
pub struct CommandClient {
    queue: mpsc::UnboundedSender<QueuedRequest>,
    busy: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
}

impl CommandClient {
    /// Create a client and spawn its worker on the current tokio runtime.
    pub fn new<C: Connector>(connector: C, config: CommandClientConfig) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let queued = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_worker(
            connector,
            config,
            rx,
            busy.clone(),
            queued.clone(),
        ));

        Self {
            queue,
            busy,
            queued,
        }
    }

    /// Send one request and wait for its response.
    ///
    /// Callers that overlap are queued behind the request in flight.
    #[instrument(skip(self, payload))]
    pub async fn request(&self, payload: Value) -> Result<Value, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(QueuedRequest { payload, reply }).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(CommandError::Closed);
        }
        rx.await.map_err(|_| CommandError::Closed)?
    }

    /// True while a request is on the wire.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Requests waiting behind the one in flight.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

async fn run_worker<C: Connector>(
    connector: C,
    config: CommandClientConfig,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    busy: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
) {
    let mut connection: Option<FramedStream<C::Stream>> = None;

    while let Some(request) = rx.recv().await {
        queued.fetch_sub(1, Ordering::SeqCst);
        busy.store(true, Ordering::SeqCst);

        let result = execute(&connector, &config, &mut connection, &request.payload).await;
        if let Err(e) = &result {
            warn!(error = %e, "command failed, dropping connection");
            connection = None;
        }

        busy.store(false, Ordering::SeqCst);
        if request.reply.send(result).is_err() {
            debug!("command caller went away before the response arrived");
        }
    }

    debug!("command worker stopped");
}

async fn execute<C: Connector>(
    connector: &C,
    config: &CommandClientConfig,
    connection: &mut Option<FramedStream<C::Stream>>,
    payload: &Value,
) -> Result<Value, CommandError> {
    if connection.is_none() {
        let connect = connector.connect();
        let stream = tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
            .await
            .map_err(|_| CommandError::Timeout(config.connect_timeout_ms))?
            .map_err(CommandError::Connect)?;
        debug!("command connection established");
        *connection = Some(FramedStream::new(stream));
    }
    let stream = connection.as_mut().ok_or(CommandError::Closed)?;

    let exchange = async {
        stream.write_json(payload).await?;
        stream.read_json::<Value>().await
    };

    tokio::time::timeout(Duration::from_millis(config.request_timeout_ms), exchange)
        .await
        .map_err(|_| CommandError::Timeout(config.request_timeout_ms))?
        .map_err(CommandError::from)
}
