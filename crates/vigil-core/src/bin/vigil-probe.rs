// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Demo child for channel supervision.
//!
//! `VIGIL_PROBE_MODE` selects the behaviour:
//!
//! | Mode | Behaviour |
//! |------|-----------|
//! | `healthy` (default) | answers every health check with a pass |
//! | `failing` | answers every health check with a fail |
//! | `silent` | connects but never answers |
//! | `chatty` | healthy, sends `Probe.ready` on start and answers `Probe.ping` with `Probe.pong` |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use vigil_core::child::ChildRuntime;
use vigil_core::process::IPC_SOCKET_ENV;
use vigil_core::{NotificationBus, Service, ServiceNode, ServiceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Healthy,
    Failing,
    Silent,
    Chatty,
}

impl Mode {
    fn from_env() -> Result<Self> {
        match std::env::var("VIGIL_PROBE_MODE").as_deref() {
            Err(_) | Ok("healthy") => Ok(Mode::Healthy),
            Ok("failing") => Ok(Mode::Failing),
            Ok("silent") => Ok(Mode::Silent),
            Ok("chatty") => Ok(Mode::Chatty),
            Ok(other) => bail!("unknown VIGIL_PROBE_MODE {other:?}"),
        }
    }
}

struct Probe {
    mode: Mode,
}

#[async_trait]
impl Service for Probe {
    fn name(&self) -> String {
        "probe".to_string()
    }

    async fn health(&self, _node: &ServiceNode, _timeout: Duration) -> anyhow::Result<Value> {
        match self.mode {
            Mode::Failing => bail!("probe configured to fail"),
            _ => Ok(json!({ "pid": std::process::id() })),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vigil=info,vigil_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = Mode::from_env()?;
    info!(?mode, pid = std::process::id(), "Probe starting");

    if mode == Mode::Silent {
        // Hold the channel open without ever reading from it
        let _stream = match std::env::var_os(IPC_SOCKET_ENV) {
            Some(path) => Some(tokio::net::UnixStream::connect(path).await?),
            None => None,
        };
        std::future::pending::<()>().await;
        return Ok(());
    }

    let root = ServiceNode::new(Arc::new(Probe { mode }), NotificationBus::new());
    let runtime = ChildRuntime::connect_from_env(root.clone()).await?;

    if mode == Mode::Chatty {
        let pong = runtime.clone();
        root.subscribe(
            "Probe.ping",
            vigil_core::handler(move |n| {
                let runtime = pong.clone();
                async move {
                    runtime.send("Probe.pong", n.arg(0).clone()).await?;
                    Ok::<_, anyhow::Error>(Value::Null)
                }
            }),
        );

        let ready = runtime.clone();
        tokio::spawn(async move {
            ready.root().wait_for_state(ServiceState::Running).await;
            if let Err(e) = ready
                .send("Probe.ready", json!({ "pid": std::process::id() }))
                .await
            {
                tracing::warn!(error = %e, "failed to announce readiness");
            }
        });
    }

    let shutdown = runtime.shutdown_handle();
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("Probe received shutdown signal");
        shutdown.notify_one();
    });

    runtime.run().await?;
    info!("Probe stopped");
    Ok(())
}
