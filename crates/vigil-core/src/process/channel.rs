// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parent side of a structured message channel to a child process.
//!
//! The channel is a Unix stream carrying length-prefixed JSON
//! [`IpcMessage`] frames. A reader task owns the read half: health replies
//! go to the single pending check, everything else is queued for a dispatcher
//! task that republishes it on the bus in arrival order. Bus handlers never
//! hold up the reader, so a reply behind a slow event still settles its check.
//! Health checks are serialised through a FIFO gate so at most one is pending
//! per channel, and every check carries an id so a late reply to an expired
//! check can never settle a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use vigil_protocol::{
    FrameError, FramedStream, IpcMessage, SERVICE_STATUS_FAIL, SERVICE_STATUS_PASS, StatusFailure,
};

use crate::bus::NotificationBus;
use crate::error::{Error, Result};
use crate::sync::lock;

/// Budget kept back when forwarding a health timeout to the child, so the
/// child's own deadline fires before the parent gives up.
pub const HEALTH_TIMEOUT_MARGIN: Duration = Duration::from_millis(10);

struct PendingCheck {
    id: u64,
    reply: oneshot::Sender<Result<Value>>,
}

pub(crate) struct Channel {
    service: String,
    writer: tokio::sync::Mutex<FramedStream<OwnedWriteHalf>>,
    pending: Mutex<Option<PendingCheck>>,
    gate: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Take over a connected stream and start the reader task.
    pub(crate) fn open(
        service: impl Into<String>,
        stream: UnixStream,
        bus: Arc<NotificationBus>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let channel = Arc::new(Self {
            service: service.into(),
            writer: tokio::sync::Mutex::new(FramedStream::new(write_half)),
            pending: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            reader: Mutex::new(None),
        });

        let (events, queue) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_events(channel.service.clone(), queue, bus));
        let reader = tokio::spawn(read_loop(
            channel.clone(),
            FramedStream::new(read_half),
            events,
        ));
        *lock(&channel.reader) = Some(reader);
        channel
    }

    /// Deliver one message to the child.
    pub(crate) async fn send(&self, message: &IpcMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_json(message).await.map_err(|e| match e {
            FrameError::Io(_) | FrameError::ConnectionClosed => {
                Error::ChannelClosed(self.service.clone())
            }
            other => other.into(),
        })
    }

    /// Ask the child to run its health probe within `timeout`.
    pub(crate) async fn check_health(&self, timeout: Duration) -> Result<Value> {
        let _turn = self.gate.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, outcome) = oneshot::channel();
        *lock(&self.pending) = Some(PendingCheck { id, reply });
        let _pending = PendingGuard { channel: self, id };

        let budget = timeout.saturating_sub(HEALTH_TIMEOUT_MARGIN);
        trace!(service = %self.service, id, budget_ms = budget.as_millis() as u64, "health request");
        self.send(&IpcMessage::health(id, budget.as_millis() as u64))
            .await?;

        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed(self.service.clone())),
            Err(_) => Err(Error::HealthCheckTimeout {
                service: self.service.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Stop the reader task. Pending checks fail with `ChannelClosed`.
    pub(crate) fn close(&self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        self.fail_pending(Error::ChannelClosed(self.service.clone()));
    }

    fn fail_pending(&self, error: Error) {
        if let Some(check) = lock(&self.pending).take() {
            let _ = check.reply.send(Err(error));
        }
    }

    fn settle(&self, message: IpcMessage) {
        let mut pending = lock(&self.pending);
        let Some(check) = pending.take() else {
            warn!(
                service = %self.service,
                status = %message.name,
                id = ?message.id,
                "Unsolicited status received"
            );
            return;
        };

        if message.id.is_some_and(|id| id != check.id) {
            warn!(
                service = %self.service,
                id = ?message.id,
                pending = check.id,
                "Discarding status reply for an expired health check"
            );
            *pending = Some(check);
            return;
        }

        let outcome = match message.name.as_str() {
            SERVICE_STATUS_PASS => Ok(message.data),
            SERVICE_STATUS_FAIL => {
                let failure: StatusFailure =
                    serde_json::from_value(message.data).unwrap_or_else(|_| StatusFailure {
                        message: "health check failed".to_string(),
                        stack: None,
                    });
                Err(Error::HealthCheckFailed {
                    service: self.service.clone(),
                    message: failure.message,
                    stack: failure.stack,
                })
            }
            other => {
                warn!(service = %self.service, status = other, "Invalid Service.status message");
                *pending = Some(check);
                return;
            }
        };

        let _ = check.reply.send(outcome);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

/// Clears the pending slot when a check ends, however it ends.
struct PendingGuard<'a> {
    channel: &'a Channel,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = lock(&self.channel.pending);
        if pending.as_ref().is_some_and(|p| p.id == self.id) {
            *pending = None;
        }
    }
}

async fn read_loop(
    channel: Arc<Channel>,
    mut reader: FramedStream<OwnedReadHalf>,
    events: mpsc::UnboundedSender<IpcMessage>,
) {
    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => {
                debug!(service = %channel.service, "channel closed by child");
                channel.fail_pending(Error::ChannelClosed(channel.service.clone()));
                break;
            }
            Err(e) => {
                warn!(service = %channel.service, error = %e, "channel read failed");
                channel.fail_pending(e.into());
                break;
            }
        };

        // Frame boundaries are intact, so a bad payload only costs one message
        let message: IpcMessage = match frame.decode_json() {
            Ok(message) => message,
            Err(e) => {
                warn!(service = %channel.service, error = %e, "malformed message from child");
                channel.fail_pending(e.into());
                continue;
            }
        };

        if message.is_status() {
            channel.settle(message);
            continue;
        }

        trace!(service = %channel.service, name = %message.name, "event from child");
        if events.send(message).is_err() {
            break;
        }
    }
}

/// Publish child events one at a time. Ends once the reader is gone and the
/// queue is drained.
async fn dispatch_events(
    service: String,
    mut queue: mpsc::UnboundedReceiver<IpcMessage>,
    bus: Arc<NotificationBus>,
) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = bus
            .publish(&message.name, vec![message.data], Some(&service))
            .await
        {
            warn!(service = %service, error = %e, "handler for child event failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Notification, handler};
    use serde_json::json;
    use vigil_protocol::{Frame, SERVICE_HEALTH};

    fn open_pair() -> (Arc<Channel>, FramedStream<UnixStream>, Arc<NotificationBus>) {
        let (parent, child) = UnixStream::pair().unwrap();
        let bus = NotificationBus::new();
        let channel = Channel::open("probe", parent, bus.clone());
        (channel, FramedStream::new(child), bus)
    }

    // ====== Health checks ======

    #[tokio::test]
    async fn test_health_pass_and_margin() {
        let (channel, mut child, _bus) = open_pair();

        let responder = tokio::spawn(async move {
            let request: IpcMessage = child.read_json().await.unwrap();
            assert_eq!(request.name, SERVICE_HEALTH);
            assert_eq!(request.health_timeout_ms(), Some(990));
            child
                .write_json(&IpcMessage::pass(request.id, json!({"ok": true})))
                .await
                .unwrap();
        });

        let result = channel.check_health(Duration::from_millis(1000)).await;
        responder.await.unwrap();
        assert_eq!(result.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_health_fail_carries_message() {
        let (channel, mut child, _bus) = open_pair();

        tokio::spawn(async move {
            let request: IpcMessage = child.read_json().await.unwrap();
            let failure = StatusFailure {
                message: "camera offline".to_string(),
                stack: Some("at probe".to_string()),
            };
            child
                .write_json(&IpcMessage::fail(request.id, &failure))
                .await
                .unwrap();
        });

        let result = channel.check_health(Duration::from_secs(1)).await;
        match result {
            Err(Error::HealthCheckFailed { message, stack, .. }) => {
                assert_eq!(message, "camera offline");
                assert_eq!(stack.as_deref(), Some("at probe"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_late_reply_does_not_settle_newer_check() {
        let (channel, mut child, _bus) = open_pair();

        // First check expires without a reply
        let first_request = {
            let check = channel.check_health(Duration::from_millis(100));
            let read = child.read_json::<IpcMessage>();
            let (result, request) = tokio::join!(check, read);
            assert!(matches!(result, Err(Error::HealthCheckTimeout { .. })));
            request.unwrap()
        };

        let second = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.check_health(Duration::from_secs(2)).await })
        };
        let second_request: IpcMessage = child.read_json().await.unwrap();
        assert_ne!(first_request.id, second_request.id);

        child
            .write_json(&IpcMessage::pass(first_request.id, json!("stale")))
            .await
            .unwrap();
        child
            .write_json(&IpcMessage::pass(second_request.id, json!("fresh")))
            .await
            .unwrap();

        assert_eq!(second.await.unwrap().unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_malformed_frame_fails_pending_check() {
        let (channel, mut child, _bus) = open_pair();

        tokio::spawn(async move {
            let _: IpcMessage = child.read_json().await.unwrap();
            let garbage = Frame::new(b"\x00not json".to_vec()).unwrap();
            child.write_frame(&garbage).await.unwrap();
            // Keep the stream open so the failure comes from the payload
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let result = channel.check_health(Duration::from_millis(500)).await;
        assert!(matches!(result, Err(Error::ProtocolFraming(_))));
    }

    #[tokio::test]
    async fn test_child_closing_fails_pending_check() {
        let (channel, mut child, _bus) = open_pair();

        tokio::spawn(async move {
            let _: IpcMessage = child.read_json().await.unwrap();
            drop(child);
        });

        let result = channel.check_health(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::ChannelClosed(_))));
    }

    // ====== Events ======

    #[tokio::test]
    async fn test_events_are_republished_on_bus() {
        let (_channel, mut child, bus) = open_pair();
        let (tx, rx) = oneshot::channel::<(String, Value, Option<String>)>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        bus.subscribe(
            "Camera.motion.start",
            handler(move |n: Notification| {
                let tx = tx.clone();
                async move {
                    if let Some(tx) = lock(&tx).take() {
                        let _ = tx.send((
                            n.topic().to_string(),
                            n.arg(0).clone(),
                            n.publisher().map(str::to_string),
                        ));
                    }
                    Ok(Value::Null)
                }
            }),
        );

        child
            .write_json(&IpcMessage::new("Camera.motion.start", json!({"camera": "front"})))
            .await
            .unwrap();

        let (topic, data, publisher) = rx.await.unwrap();
        assert_eq!(topic, "Camera.motion.start");
        assert_eq!(data, json!({"camera": "front"}));
        assert_eq!(publisher.as_deref(), Some("probe"));
    }

    #[tokio::test]
    async fn test_slow_event_handler_does_not_delay_health_reply() {
        let (channel, mut child, bus) = open_pair();
        bus.subscribe(
            "Camera.motion",
            handler(|_n: Notification| async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(Value::Null)
            }),
        );

        tokio::spawn(async move {
            let request: IpcMessage = child.read_json().await.unwrap();
            child
                .write_json(&IpcMessage::new("Camera.motion", json!({"zone": 1})))
                .await
                .unwrap();
            child
                .write_json(&IpcMessage::pass(request.id, json!("alive")))
                .await
                .unwrap();
            // Keep the stream open while the handler is still busy
            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        let started = std::time::Instant::now();
        let result = channel.check_health(Duration::from_millis(500)).await;
        assert_eq!(result.unwrap(), json!("alive"));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_child_events_keep_arrival_order() {
        let (_channel, mut child, bus) = open_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

        bus.subscribe(
            "Camera.frame",
            handler(move |n: Notification| {
                let tx = tx.clone();
                async move {
                    // Early events linger longer, so overlap would reorder them
                    let seq = n.arg(0)["seq"].as_u64().unwrap_or_default();
                    tokio::time::sleep(Duration::from_millis(30 - seq * 10)).await;
                    let _ = tx.send(n.arg(0).clone());
                    Ok(Value::Null)
                }
            }),
        );

        for seq in 0..3u64 {
            child
                .write_json(&IpcMessage::new("Camera.frame", json!({ "seq": seq })))
                .await
                .unwrap();
        }

        for seq in 0..3u64 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event["seq"], seq);
        }
    }

    #[tokio::test]
    async fn test_unsolicited_status_is_ignored() {
        let (channel, mut child, _bus) = open_pair();

        child
            .write_json(&IpcMessage::pass(Some(99), Value::Null))
            .await
            .unwrap();

        // The channel keeps working after the stray reply
        let responder = tokio::spawn(async move {
            let request: IpcMessage = child.read_json().await.unwrap();
            child
                .write_json(&IpcMessage::pass(request.id, json!(1)))
                .await
                .unwrap();
        });
        assert_eq!(
            channel.check_health(Duration::from_secs(1)).await.unwrap(),
            json!(1)
        );
        responder.await.unwrap();
    }
}
