// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-backed service: spawn, exit watching, restart policy, stop.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_protocol::IpcMessage;

use super::channel::Channel;
use super::{ExitPolicy, IPC_SOCKET_ENV, Method, ProcessSpec, SupervisorConfig};
use crate::error::{Error, Result};
use crate::service::{Service, ServiceNode, ServiceState};
use crate::sync::lock;

/// Supervisor view of the child process.
///
/// `Running → Exited → Restarting → Running` under auto-restart,
/// `Running → Exited → Stopped` under the manual policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    Idle,
    Running,
    Exited,
    Restarting,
    Stopped,
}

/// State shared with the background exit tasks.
struct ProcessState {
    name: String,
    phase: watch::Sender<ProcessPhase>,
    pid: AtomicU32,
    started_at: Mutex<Option<DateTime<Utc>>>,
    restarts: AtomicU64,
    ready: AtomicBool,
    channel: Mutex<Option<Arc<Channel>>>,
}

impl ProcessState {
    fn set_phase(&self, next: ProcessPhase) {
        let previous = self.phase.send_replace(next);
        if previous != next {
            debug!(service = %self.name, from = ?previous, to = ?next, "process phase");
        }
    }

    fn clear_process(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
    }
}

struct RunningProcess {
    stop: CancellationToken,
    watcher: JoinHandle<()>,
}

#[derive(Debug)]
struct ExitEvent {
    status: String,
}

/// A [`Service`] that runs an external program.
pub struct ProcessService {
    spec: ProcessSpec,
    config: SupervisorConfig,
    state: Arc<ProcessState>,
    running: Mutex<Option<RunningProcess>>,
    socket_seq: AtomicU64,
}

impl ProcessService {
    pub fn new(spec: ProcessSpec, config: SupervisorConfig) -> Self {
        let state = Arc::new(ProcessState {
            name: spec.name.clone(),
            phase: watch::Sender::new(ProcessPhase::Idle),
            pid: AtomicU32::new(0),
            started_at: Mutex::new(None),
            restarts: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            channel: Mutex::new(None),
        });
        Self {
            spec,
            config,
            state,
            running: Mutex::new(None),
            socket_seq: AtomicU64::new(0),
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Pid of the current child, if one is running.
    pub fn pid(&self) -> Option<u32> {
        match self.state.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// When the current child was spawned.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.state.started_at)
    }

    /// Automatic restarts performed after unexpected exits.
    pub fn restart_count(&self) -> u64 {
        self.state.restarts.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ProcessPhase {
        *self.state.phase.borrow()
    }

    pub fn phase_changes(&self) -> watch::Receiver<ProcessPhase> {
        self.state.phase.subscribe()
    }

    /// True once startup completed and until the child goes away.
    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    /// Deliver a named message to the child over its channel.
    pub async fn send(&self, name: &str, data: Value) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotStarted(self.spec.name.clone()));
        }
        if self.spec.method == Method::Pipes {
            return Err(Error::Configuration(format!(
                "{} is spawned with pipes and has no message channel",
                self.spec.name
            )));
        }

        let channel = lock(&self.state.channel)
            .clone()
            .ok_or_else(|| Error::NotStarted(self.spec.name.clone()))?;
        channel.send(&IpcMessage::new(name, data)).await
    }

    fn liveness(&self) -> Result<Value> {
        let pid = self
            .pid()
            .ok_or_else(|| Error::NotStarted(self.spec.name.clone()))?;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => Ok(json!({ "pid": pid })),
            Err(Errno::ESRCH) => Err(Error::ProcessExit {
                service: self.spec.name.clone(),
                status: format!("pid {pid} no longer exists"),
            }),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    fn bind_socket(&self) -> Result<(PathBuf, UnixListener)> {
        std::fs::create_dir_all(&self.config.run_dir)?;

        let seq = self.socket_seq.fetch_add(1, Ordering::SeqCst);
        let stem: String = self
            .spec
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let path = self
            .config
            .run_dir
            .join(format!("{stem}-{}-{seq}.sock", std::process::id()));

        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok((path, listener))
    }

    async fn spawn(&self, node: &ServiceNode) -> Result<()> {
        let name = self.spec.name.clone();
        let spawn_error = |error: io::Error| Error::Spawn {
            service: name.clone(),
            error: Arc::new(error),
        };

        let socket = match self.spec.method {
            Method::Channel => Some(self.bind_socket()?),
            Method::Pipes => None,
        };

        let mut command = Command::new(&self.spec.program);
        command
            .args(self.spec.args.to_argv())
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match (self.spec.method, self.spec.silent) {
            (_, true) => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
            (Method::Pipes, false) => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            (Method::Channel, false) => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }
        if let Some((path, _)) = &socket {
            command.env(IPC_SOCKET_ENV, path);
        }

        let mut child = command.spawn().map_err(spawn_error)?;
        let pid = child.id().unwrap_or(0);
        debug!(service = %name, pid, program = %self.spec.program.display(), "process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(name.clone(), stdout, Output::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.clone(), stderr, Output::Stderr);
        }

        if let Some((path, listener)) = socket {
            let accepted = accept_child(&mut child, &listener, self.config.connect_timeout).await;
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(service = %name, error = %e, "could not remove socket file");
            }
            match accepted {
                Ok(stream) => {
                    let channel = Channel::open(name.clone(), stream, node.bus().clone());
                    *lock(&self.state.channel) = Some(channel);
                }
                Err(e) => {
                    if let Err(kill) = child.kill().await {
                        debug!(service = %name, error = %kill, "kill after failed connect");
                    }
                    return Err(spawn_error(e));
                }
            }
        }

        let stop = CancellationToken::new();
        let (exits_tx, exits_rx) = mpsc::channel(1);
        let watcher = tokio::spawn(watch_exit(
            name.clone(),
            child,
            stop.clone(),
            self.config.stop_grace,
            exits_tx,
        ));
        tokio::spawn(supervise_exits(
            self.state.clone(),
            self.spec.exit_policy,
            Arc::downgrade(&node.handle()?),
            exits_rx,
        ));

        self.state.pid.store(pid, Ordering::SeqCst);
        *lock(&self.state.started_at) = Some(Utc::now());
        *lock(&self.running) = Some(RunningProcess { stop, watcher });

        tokio::time::sleep(self.config.spawn_settle).await;

        // An exit during the settle delay is already in the hands of the exit
        // state machine
        let alive = lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.watcher.is_finished());
        if alive {
            self.state.ready.store(true, Ordering::SeqCst);
            self.state.set_phase(ProcessPhase::Running);
        }
        Ok(())
    }
}

#[async_trait]
impl Service for ProcessService {
    fn name(&self) -> String {
        self.spec.name.clone()
    }

    fn silent(&self) -> bool {
        self.spec.silent
    }

    async fn initialize(&self, node: &ServiceNode) -> anyhow::Result<()> {
        self.spawn(node).await?;
        Ok(())
    }

    async fn destroy(&self, _node: &ServiceNode) -> anyhow::Result<()> {
        self.state.clear_process();

        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.stop.cancel();
            if let Err(e) = running.watcher.await {
                warn!(service = %self.spec.name, error = %e, "exit watcher failed");
            }
        }

        self.state.phase.send_if_modified(|phase| {
            if *phase == ProcessPhase::Restarting {
                false
            } else {
                *phase = ProcessPhase::Stopped;
                true
            }
        });
        Ok(())
    }

    /// Liveness for piped processes; a `Service.health` exchange for
    /// channel processes.
    async fn health(&self, _node: &ServiceNode, timeout: Duration) -> anyhow::Result<Value> {
        match self.spec.method {
            Method::Pipes => Ok(self.liveness()?),
            Method::Channel => {
                let channel = lock(&self.state.channel)
                    .clone()
                    .ok_or_else(|| Error::NotStarted(self.spec.name.clone()))?;
                Ok(channel.check_health(timeout).await?)
            }
        }
    }
}

async fn accept_child(
    child: &mut Child,
    listener: &UnixListener,
    timeout: Duration,
) -> io::Result<UnixStream> {
    tokio::select! {
        accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("child did not connect within {}ms", timeout.as_millis()),
            )),
        },
        status = child.wait() => Err(io::Error::other(format!(
            "process exited before connecting: {}",
            describe(&status)
        ))),
    }
}

/// Own the child until it exits or a stop is requested.
async fn watch_exit(
    service: String,
    mut child: Child,
    stop: CancellationToken,
    grace: Duration,
    exits: mpsc::Sender<ExitEvent>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop.cancelled() => None,
    };

    match exited {
        Some(status) if !stop.is_cancelled() => {
            let event = ExitEvent {
                status: describe(&status),
            };
            if exits.send(event).await.is_err() {
                debug!(service = %service, "exit state machine is gone");
            }
        }
        Some(status) => {
            debug!(service = %service, status = %describe(&status), "process exited during stop");
        }
        None => terminate(&service, &mut child, grace).await,
    }
}

/// Exit state machine for one spawned child.
async fn supervise_exits(
    state: Arc<ProcessState>,
    policy: ExitPolicy,
    node: Weak<ServiceNode>,
    mut exits: mpsc::Receiver<ExitEvent>,
) {
    // The sender is dropped without a message when the stop was requested
    let Some(exit) = exits.recv().await else {
        return;
    };

    state.ready.store(false, Ordering::SeqCst);
    state.pid.store(0, Ordering::SeqCst);
    state.set_phase(ProcessPhase::Exited);
    warn!(service = %state.name, status = %exit.status, "process exited unexpectedly");

    let Some(node) = node.upgrade() else {
        return;
    };
    if matches!(node.state(), ServiceState::Stopping | ServiceState::Stopped) {
        debug!(service = %state.name, "exit raced with a stop, not acting on it");
        state.set_phase(ProcessPhase::Stopped);
        return;
    }

    match policy {
        ExitPolicy::AutoRestart => {
            state.set_phase(ProcessPhase::Restarting);
            let attempt = state.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            info!(service = %state.name, attempt, "restarting process");
            if let Err(e) = node.restart().await {
                error!(service = %state.name, error = %e, "restart failed");
                state.set_phase(ProcessPhase::Stopped);
            }
        }
        ExitPolicy::Manual => {
            if let Err(e) = node.stop().await {
                warn!(service = %state.name, error = %e, "stop after exit failed");
            }
            state.set_phase(ProcessPhase::Stopped);
        }
    }
}

/// SIGTERM, then SIGKILL once `grace` runs out.
async fn terminate(service: &str, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => debug!(service, pid, "sent SIGTERM"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(service, pid, error = %e, "failed to send SIGTERM"),
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(service, %status, "process stopped"),
        Ok(Err(e)) => warn!(service, error = %e, "failed to reap process"),
        Err(_) => {
            warn!(
                service,
                grace_ms = grace.as_millis() as u64,
                "process ignored SIGTERM, killing"
            );
            if let Err(e) = child.kill().await {
                warn!(service, error = %e, "failed to kill process");
            }
        }
    }
}

fn describe(status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown ({e})"),
    }
}

#[derive(Debug, Clone, Copy)]
enum Output {
    Stdout,
    Stderr,
}

fn forward_output<R>(service: String, stream: R, output: Output)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match output {
                Output::Stdout => debug!(service = %service, "{line}"),
                Output::Stderr => warn!(service = %service, "{line}"),
            }
        }
    });
}
