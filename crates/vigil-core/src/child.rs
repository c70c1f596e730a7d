// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child side of a supervised process.
//!
//! A program spawned with [`Method::Channel`](crate::process::Method) builds
//! its own service tree and hands the root to [`ChildRuntime`]. The runtime
//! connects back to the supervisor over the socket named by
//! [`IPC_SOCKET_ENV`], answers `Service.health` requests by running the
//! root's `check_health`, republishes every other message from the parent on
//! the local bus, and lets local code push events up with
//! [`ChildRuntime::send`].
//!
//! Without a supervisor (the variable is unset) the runtime runs standalone
//! and watches its own tree with a logging health monitor.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use vigil_protocol::{FrameError, FramedStream, IpcMessage, SERVICE_HEALTH, StatusFailure};

use crate::error::{Error, Result};
use crate::monitor::{FailurePolicy, HealthMonitor, HealthMonitorConfig};
use crate::process::IPC_SOCKET_ENV;
use crate::service::ServiceNode;
use crate::sync::lock;

/// Budget used when a health request does not carry one.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Publisher name used for messages that came from the supervisor.
const PARENT: &str = "parent";

/// Runtime for a service tree living inside a supervised child process.
pub struct ChildRuntime {
    root: Arc<ServiceNode>,
    writer: Option<Mutex<FramedStream<OwnedWriteHalf>>>,
    reader: Mutex<Option<FramedStream<OwnedReadHalf>>>,
    monitor: std::sync::Mutex<HealthMonitorConfig>,
    shutdown: Arc<Notify>,
}

impl ChildRuntime {
    /// Connect to the supervisor named by the environment, or run standalone
    /// when there is none.
    pub async fn connect_from_env(root: Arc<ServiceNode>) -> Result<Arc<Self>> {
        match std::env::var_os(IPC_SOCKET_ENV) {
            Some(path) => Self::connect(root, Path::new(&path)).await,
            None => {
                info!(service = %root.name(), "No supervisor channel, running standalone");
                Ok(Self::standalone(root))
            }
        }
    }

    /// Connect to a supervisor listening on `path`.
    pub async fn connect(root: Arc<ServiceNode>, path: &Path) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(path).await?;
        debug!(service = %root.name(), path = %path.display(), "connected to supervisor");
        Ok(Self::over(root, stream))
    }

    /// Use an already connected stream to the supervisor.
    pub fn over(root: Arc<ServiceNode>, stream: UnixStream) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        Arc::new(Self {
            root,
            writer: Some(Mutex::new(FramedStream::new(write_half))),
            reader: Mutex::new(Some(FramedStream::new(read_half))),
            monitor: std::sync::Mutex::new(standalone_monitor()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Runtime without a supervisor.
    pub fn standalone(root: Arc<ServiceNode>) -> Arc<Self> {
        Arc::new(Self {
            root,
            writer: None,
            reader: Mutex::new(None),
            monitor: std::sync::Mutex::new(standalone_monitor()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Override the standalone health monitor timing. Read when
    /// [`run`](Self::run) starts.
    pub fn set_health_monitor(&self, interval: Duration, timeout: Duration) {
        let mut monitor = lock(&self.monitor);
        monitor.interval = interval;
        monitor.timeout = timeout;
    }

    pub fn health_monitor(&self) -> HealthMonitorConfig {
        lock(&self.monitor).clone()
    }

    pub fn root(&self) -> &Arc<ServiceNode> {
        &self.root
    }

    pub fn is_supervised(&self) -> bool {
        self.writer.is_some()
    }

    /// Handle that makes [`run`](Self::run) stop the tree and return.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Push a named event to the supervisor.
    pub async fn send(&self, name: &str, data: Value) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| Error::NotStarted(format!("{} supervisor channel", self.root.name())))?;
        write(writer, &IpcMessage::new(name, data), self.root.name()).await
    }

    /// Start the tree and serve the supervisor until the channel closes or
    /// shutdown is signalled, then stop the tree.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.root.start().await?;

        let served = match self.reader.lock().await.take() {
            Some(reader) => {
                tokio::select! {
                    result = self.serve(reader) => result,
                    _ = self.shutdown.notified() => Ok(()),
                }
            }
            None => {
                let monitor = HealthMonitor::new(self.root.clone(), self.health_monitor());
                tokio::select! {
                    result = monitor.run() => result,
                    _ = self.shutdown.notified() => Ok(()),
                }
            }
        };

        let stopped = self.root.stop().await;
        served.and(stopped)
    }

    async fn serve(self: &Arc<Self>, mut reader: FramedStream<OwnedReadHalf>) -> Result<()> {
        loop {
            let message: IpcMessage = match reader.read_json().await {
                Ok(message) => message,
                Err(FrameError::ConnectionClosed) => {
                    info!(service = %self.root.name(), "Supervisor closed the channel");
                    return Ok(());
                }
                Err(FrameError::Json(e)) => {
                    warn!(service = %self.root.name(), error = %e, "malformed message from supervisor");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if message.name == SERVICE_HEALTH {
                // Answer off the read loop so events keep flowing meanwhile
                let this = self.clone();
                tokio::spawn(async move { this.answer_health(message).await });
                continue;
            }

            if let Err(e) = self
                .root
                .bus()
                .publish(&message.name, vec![message.data], Some(PARENT))
                .await
            {
                warn!(service = %self.root.name(), error = %e, "handler for supervisor message failed");
            }
        }
    }

    async fn answer_health(&self, request: IpcMessage) {
        let timeout = request
            .health_timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HEALTH_TIMEOUT);

        let reply = match self.root.check_health(timeout).await {
            Ok(()) => IpcMessage::pass(
                request.id,
                json!({ "service": self.root.name(), "pid": std::process::id() }),
            ),
            Err(e) => IpcMessage::fail(
                request.id,
                &StatusFailure {
                    message: e.to_string(),
                    stack: Some(format!("{e:?}")),
                },
            ),
        };

        if let Some(writer) = &self.writer {
            if let Err(e) = write(writer, &reply, self.root.name()).await {
                warn!(service = %self.root.name(), error = %e, "failed to answer health check");
            }
        }
    }
}

async fn write(
    writer: &Mutex<FramedStream<OwnedWriteHalf>>,
    message: &IpcMessage,
    service: &str,
) -> Result<()> {
    writer
        .lock()
        .await
        .write_json(message)
        .await
        .map_err(|e| match e {
            FrameError::Io(_) | FrameError::ConnectionClosed => {
                Error::ChannelClosed(format!("{service} supervisor"))
            }
            other => other.into(),
        })
}

fn standalone_monitor() -> HealthMonitorConfig {
    HealthMonitorConfig {
        on_failure: FailurePolicy::Log,
        ..HealthMonitorConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Notification, NotificationBus, handler};
    use crate::service::Service;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Camera {
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for Camera {
        fn name(&self) -> String {
            "camera".to_string()
        }

        async fn health(&self, _node: &ServiceNode, _timeout: Duration) -> anyhow::Result<Value> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(Value::Null)
            } else {
                anyhow::bail!("sensor unplugged")
            }
        }
    }

    fn pair(healthy: bool) -> (Arc<ChildRuntime>, FramedStream<UnixStream>) {
        let (parent, child) = UnixStream::pair().unwrap();
        let root = ServiceNode::new(
            Arc::new(Camera {
                healthy: Arc::new(AtomicBool::new(healthy)),
            }),
            NotificationBus::new(),
        );
        (ChildRuntime::over(root, child), FramedStream::new(parent))
    }

    #[tokio::test]
    async fn test_answers_health_with_request_id() {
        let (runtime, mut parent) = pair(true);
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.run().await }
        });

        parent.write_json(&IpcMessage::health(41, 500)).await.unwrap();
        let reply: IpcMessage = parent.read_json().await.unwrap();

        assert_eq!(reply.name, vigil_protocol::SERVICE_STATUS_PASS);
        assert_eq!(reply.id, Some(41));
        assert_eq!(reply.data["service"], "camera");

        drop(parent);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failing_probe_replies_fail() {
        let (runtime, mut parent) = pair(false);
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.run().await }
        });

        parent.write_json(&IpcMessage::health(7, 500)).await.unwrap();
        let reply: IpcMessage = parent.read_json().await.unwrap();

        assert_eq!(reply.name, vigil_protocol::SERVICE_STATUS_FAIL);
        assert_eq!(reply.id, Some(7));
        let failure: StatusFailure = serde_json::from_value(reply.data).unwrap();
        assert!(failure.message.contains("sensor unplugged"));

        runtime.shutdown_handle().notify_one();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_parent_messages_reach_local_bus_and_events_reach_parent() {
        let (runtime, mut parent) = pair(true);
        let (tx, rx) = tokio::sync::oneshot::channel::<Value>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));

        runtime.root().bus().subscribe(
            "Camera.snapshot",
            handler(move |n: Notification| {
                let tx = tx.clone();
                async move {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(n.arg(0).clone());
                    }
                    Ok(Value::Null)
                }
            }),
        );

        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.run().await }
        });

        parent
            .write_json(&IpcMessage::new("Camera.snapshot", json!({"width": 640})))
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), json!({"width": 640}));

        runtime
            .send("Camera.motion.start", json!({"zone": 2}))
            .await
            .unwrap();
        let event: IpcMessage = parent.read_json().await.unwrap();
        assert_eq!(event.name, "Camera.motion.start");
        assert_eq!(event.data, json!({"zone": 2}));

        drop(parent);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_standalone_send_is_rejected() {
        let root = ServiceNode::new(
            Arc::new(Camera {
                healthy: Arc::new(AtomicBool::new(true)),
            }),
            NotificationBus::new(),
        );
        let runtime = ChildRuntime::standalone(root);

        assert!(!runtime.is_supervised());
        assert!(matches!(
            runtime.send("x", Value::Null).await,
            Err(Error::NotStarted(_))
        ));
    }

    struct Counted {
        probes: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Service for Counted {
        fn name(&self) -> String {
            "counted".to_string()
        }

        async fn health(&self, _node: &ServiceNode, _timeout: Duration) -> anyhow::Result<Value> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_monitor_timing_applies_to_shared_runtime() {
        let probes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let root = ServiceNode::new(
            Arc::new(Counted {
                probes: probes.clone(),
            }),
            NotificationBus::new(),
        );
        let runtime = ChildRuntime::standalone(root);
        let shared = runtime.clone();

        shared.set_health_monitor(Duration::from_millis(20), Duration::from_millis(100));
        assert_eq!(runtime.health_monitor().interval, Duration::from_millis(20));
        assert_eq!(runtime.health_monitor().timeout, Duration::from_millis(100));

        let task = tokio::spawn(async move { runtime.run().await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        shared.shutdown_handle().notify_one();
        task.await.unwrap().unwrap();

        assert!(probes.load(Ordering::SeqCst) >= 3);
    }
}
