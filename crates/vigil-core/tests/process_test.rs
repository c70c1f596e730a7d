// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process supervision tests against `/bin/sh` and the `vigil-probe` binary.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal;
use nix::unistd::Pid;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use vigil_core::process::{ExitPolicy, Method, ProcessPhase, SupervisorConfig};
use vigil_core::{
    Error, Group, Notification, NotificationBus, ProcessService, ProcessSpec, ServiceNode,
    ServiceState, handler,
};

const PROBE: &str = env!("CARGO_BIN_EXE_vigil-probe");

fn config(run_dir: &TempDir) -> SupervisorConfig {
    SupervisorConfig {
        run_dir: run_dir.path().to_path_buf(),
        connect_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_millis(500),
        spawn_settle: Duration::from_millis(30),
    }
}

/// Root group with one supervised process.
fn supervise(spec: ProcessSpec, run_dir: &TempDir) -> (Arc<ServiceNode>, Arc<ProcessService>) {
    let root = ServiceNode::new(Arc::new(Group::new("nvr")), NotificationBus::new());
    let service = Arc::new(ProcessService::new(spec, config(run_dir)));
    root.add_service(service.clone(), []).unwrap();
    (root, service)
}

fn probe(name: &str, mode: &str) -> ProcessSpec {
    ProcessSpec::new(name, PROBE)
        .method(Method::Channel)
        .env("VIGIL_PROBE_MODE", mode)
}

async fn wait_until(what: &str, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn test_piped_process_is_healthy_and_stops() {
    let run_dir = TempDir::new().unwrap();
    let (root, service) = supervise(
        ProcessSpec::new("sleeper", "/bin/sh").args(["-c", "echo started; sleep 30"]),
        &run_dir,
    );

    root.start().await.unwrap();
    let pid = service.pid().expect("pid while running");
    assert!(service.is_ready());
    assert!(service.started_at().is_some());
    assert_eq!(service.phase(), ProcessPhase::Running);

    root.check_health(Duration::from_millis(500)).await.unwrap();

    root.stop().await.unwrap();
    assert_eq!(service.pid(), None);
    assert_eq!(service.phase(), ProcessPhase::Stopped);
    wait_until("process to go away", Duration::from_secs(2), || !alive(pid)).await;
}

#[tokio::test]
async fn test_unexpected_exit_restarts_process() {
    let run_dir = TempDir::new().unwrap();
    let (root, service) = supervise(
        ProcessSpec::new("flaky", "/bin/sh").args(["-c", "sleep 0.3; exit 3"]),
        &run_dir,
    );

    root.start().await.unwrap();
    let first_pid = service.pid().unwrap();

    wait_until("automatic restart", Duration::from_secs(5), || {
        service.restart_count() >= 1 && service.phase() == ProcessPhase::Running
    })
    .await;

    let second_pid = service.pid().unwrap();
    assert_ne!(first_pid, second_pid);
    assert_eq!(root.child("flaky").unwrap().state(), ServiceState::Running);

    root.stop().await.unwrap();
}

#[tokio::test]
async fn test_manual_policy_leaves_process_stopped() {
    let run_dir = TempDir::new().unwrap();
    let (root, service) = supervise(
        ProcessSpec::new("oneshot", "/bin/sh")
            .args(["-c", "sleep 0.2"])
            .exit_policy(ExitPolicy::Manual),
        &run_dir,
    );

    root.start().await.unwrap();
    let node = root.child("oneshot").unwrap();

    wait_until("manual stop", Duration::from_secs(5), || {
        service.phase() == ProcessPhase::Stopped && node.state() == ServiceState::Stopped
    })
    .await;

    assert_eq!(service.restart_count(), 0);
    assert_eq!(service.pid(), None);
    root.stop().await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_fails_start() {
    let run_dir = TempDir::new().unwrap();
    let (root, _) = supervise(
        ProcessSpec::new("missing", "/nonexistent/vigil-binary"),
        &run_dir,
    );

    let err = root.start().await.unwrap_err();
    assert!(matches!(err, Error::Spawn { ref service, .. } if service == "missing"));
    assert_eq!(root.state(), ServiceState::Failed);
}

#[tokio::test]
async fn test_piped_process_has_no_message_channel() {
    let run_dir = TempDir::new().unwrap();
    let (root, service) = supervise(
        ProcessSpec::new("sleeper", "/bin/sh").args(["-c", "sleep 30"]),
        &run_dir,
    );

    assert!(matches!(
        service.send("Probe.ping", Value::Null).await,
        Err(Error::NotStarted(_))
    ));

    root.start().await.unwrap();
    assert!(matches!(
        service.send("Probe.ping", Value::Null).await,
        Err(Error::Configuration(_))
    ));
    root.stop().await.unwrap();
}

#[tokio::test]
async fn test_channel_child_answers_health() {
    let run_dir = TempDir::new().unwrap();
    let (root, service) = supervise(probe("probe", "healthy"), &run_dir);

    root.start().await.unwrap();
    assert!(service.is_ready());

    root.check_health(Duration::from_millis(1000)).await.unwrap();
    root.check_health(Duration::from_millis(1000)).await.unwrap();

    root.stop().await.unwrap();
    assert_eq!(service.phase(), ProcessPhase::Stopped);
}

#[tokio::test]
async fn test_channel_child_reports_failure() {
    let run_dir = TempDir::new().unwrap();
    let (root, _) = supervise(probe("probe", "failing"), &run_dir);

    root.start().await.unwrap();
    let err = root
        .check_health(Duration::from_millis(1000))
        .await
        .unwrap_err();

    match err {
        Error::HealthCheckFailed {
            service, message, ..
        } => {
            assert_eq!(service, "probe");
            assert!(message.contains("probe configured to fail"), "{message}");
        }
        other => panic!("expected a failed health check, got {other}"),
    }
    root.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_child_times_out() {
    let run_dir = TempDir::new().unwrap();
    let (root, _) = supervise(probe("probe", "silent"), &run_dir);

    root.start().await.unwrap();
    let started = Instant::now();
    let err = root
        .check_health(Duration::from_millis(1000))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(matches!(err, Error::HealthCheckTimeout { .. }), "{err}");
    root.stop().await.unwrap();
}

#[tokio::test]
async fn test_channel_events_travel_both_ways() {
    let run_dir = TempDir::new().unwrap();
    let (root, service) = supervise(probe("probe", "chatty"), &run_dir);
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Option<String>, Value)>();
    let tx = Arc::new(Mutex::new(tx));

    for topic in ["Probe.ready", "Probe.pong"] {
        let tx = tx.clone();
        root.bus().subscribe(
            topic,
            handler(move |n: Notification| {
                let tx = tx.clone();
                async move {
                    let _ = tx.lock().unwrap().send((
                        n.topic().to_string(),
                        n.publisher().map(str::to_string),
                        n.arg(0).clone(),
                    ));
                    Ok(Value::Null)
                }
            }),
        );
    }

    root.start().await.unwrap();

    let (topic, publisher, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "Probe.ready");
    assert_eq!(publisher.as_deref(), Some("probe"));
    assert!(data["pid"].is_u64());

    service
        .send("Probe.ping", json!({ "seq": 7 }))
        .await
        .unwrap();
    let (topic, _, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "Probe.pong");
    assert_eq!(data, json!({ "seq": 7 }));

    root.stop().await.unwrap();
}
