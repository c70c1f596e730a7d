// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Media bridge tests against a fake media server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use vigil_core::media::{MediaBridge, MediaCommandClient, MediaConfig, MediaError, MediaEvent};
use vigil_core::{Notification, NotificationBus, ServiceNode, handler};
use vigil_protocol::{CommandClientConfig, FramedStream, TcpConnector};

type Requests = Arc<Mutex<Vec<Value>>>;

/// Fake CLI port: records every request and answers with `respond`.
async fn fake_cli(respond: fn(&Value) -> Value) -> (String, Requests) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let requests: Requests = Arc::new(Mutex::new(Vec::new()));

    let log = requests.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let mut framed = FramedStream::new(stream);
                while let Ok(request) = framed.read_json::<Value>().await {
                    log.lock().unwrap().push(request.clone());
                    if framed.write_json(&respond(&request)).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, requests)
}

fn media_server(request: &Value) -> Value {
    let params = &request["parameters"];
    match request["command"].as_str().unwrap_or_default() {
        "record" if params["localStreamName"] == "broken" => {
            json!({ "status": "FAIL", "description": "disk full" })
        }
        "record" => json!({ "status": "SUCCESS", "data": { "configId": 42 } }),
        "createWrtcAcceptor" => json!({ "status": "SUCCESS", "data": { "protocolId": 5 } }),
        "addStreamAlias" => json!({
            "status": "SUCCESS",
            "data": { "aliasName": params["aliasName"] }
        }),
        _ => json!({ "status": "SUCCESS", "data": {} }),
    }
}

fn client(addr: &str) -> MediaCommandClient {
    MediaCommandClient::new(
        TcpConnector::new(addr),
        CommandClientConfig {
            connect_timeout_ms: 1_000,
            request_timeout_ms: 2_000,
        },
    )
}

#[tokio::test]
async fn test_recording_helpers() {
    let (addr, requests) = fake_cli(media_server).await;
    let client = client(&addr);

    let config_id = client
        .start_recording(json!({ "localStreamName": "cam1", "pathToFile": "/videos/cam1" }))
        .await
        .unwrap();
    assert_eq!(config_id, json!(42));

    let err = client
        .start_recording(json!({ "localStreamName": "broken" }))
        .await
        .unwrap_err();
    match err {
        MediaError::Rejected {
            command,
            description,
        } => {
            assert_eq!(command, "record");
            assert_eq!(description, "disk full");
        }
        other => panic!("expected a rejected command, got {other}"),
    }

    client.stop_recording(config_id).await.unwrap();

    let requests = requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[2],
        json!({ "command": "removeConfig", "parameters": { "id": 42, "permanently": 1 } })
    );
}

#[tokio::test]
async fn test_ingest_point_is_created_once_per_stream() {
    let (addr, requests) = fake_cli(media_server).await;
    let client = client(&addr);

    let first = client.create_ingest_point("cam1").await.unwrap();
    let again = client.create_ingest_point("cam1").await.unwrap();
    let other = client.create_ingest_point("cam2").await.unwrap();

    assert_eq!(first, again);
    assert_ne!(first, other);
    assert_eq!(first.len(), 16);

    let requests = requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["command"], "createIngestPoint");
    assert_eq!(requests[0]["parameters"]["publicStreamName"], "cam1");
    assert_eq!(requests[0]["parameters"]["privateStreamName"], first.as_str());
}

#[tokio::test]
async fn test_stream_alias_helpers() {
    let (addr, requests) = fake_cli(media_server).await;
    let client = client(&addr);

    let data = client.create_stream_alias("cam1", "live-cam1").await.unwrap();
    assert_eq!(data, json!({ "aliasName": "live-cam1" }));
    client.remove_stream_alias("live-cam1").await.unwrap();

    let requests = requests.lock().unwrap().clone();
    assert_eq!(
        requests[0]["parameters"],
        json!({ "localStreamName": "cam1", "aliasName": "live-cam1" })
    );
    assert_eq!(requests[1]["command"], "removeStreamAlias");
}

/// Forward every notification on `topics` into a channel.
fn capture(bus: &Arc<NotificationBus>, topics: &[&str]) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for topic in topics {
        let tx = tx.clone();
        bus.subscribe(
            topic,
            handler(move |n: Notification| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((n.topic().to_string(), n.arg(0).clone()));
                    Ok(Value::Null)
                }
            }),
        );
    }
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within 5s")
        .expect("channel open")
}

async fn push(events: &mut FramedStream<TcpStream>, kind: &str, payload: Value) {
    events
        .write_json(&MediaEvent {
            kind: kind.to_string(),
            payload,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bridge_serves_bus_requests_and_routes_events() {
    let (cli_addr, _) = fake_cli(media_server).await;
    let bus = NotificationBus::new();
    let bridge = Arc::new(MediaBridge::new(
        "media",
        MediaConfig {
            cli_addr,
            event_addr: "127.0.0.1:0".to_string(),
            ..MediaConfig::default()
        },
    ));
    let node = ServiceNode::new(bridge.clone(), bus.clone());
    let mut rx = capture(
        &bus,
        &[
            "EMS.inStreamCreated",
            "EMS.inStreamCreated.cam1",
            "EMS.outStreamClosed",
            "EMS.newSegment",
        ],
    );

    node.start().await.unwrap();

    let config_id = bus
        .publish(
            "EMS.startRecording",
            vec![json!({ "localStreamName": "cam1" })],
            Some("recorder"),
        )
        .await
        .unwrap();
    assert_eq!(config_id, Some(json!(42)));

    let stream = TcpStream::connect(bridge.event_addr().unwrap()).await.unwrap();
    let mut events = FramedStream::new(stream);

    push(&mut events, "inStreamCreated", json!({ "name": "cam1", "uniqueId": 3 })).await;
    assert_eq!(next(&mut rx).await.0, "EMS.inStreamCreated");
    let (topic, payload) = next(&mut rx).await;
    assert_eq!(topic, "EMS.inStreamCreated.cam1");
    assert_eq!(payload["uniqueId"], 3);

    push(&mut events, "someInternalEvent", json!({})).await;
    push(&mut events, "outStreamClosed", json!({ "name": "cam1-out" })).await;
    assert_eq!(next(&mut rx).await.0, "EMS.outStreamClosed");

    push(
        &mut events,
        "recordChunkClosed",
        json!({
            "clockSync": {
                "wallClock": 1_000_000,
                "streamClock": 300,
                "streamClockBase": 200,
                "segmentStartTs": 0,
            },
            "segmentStartTs": 500,
            "segmentDuration": 4_000,
            "file": "/videos/cam1/seg.mp4",
            "customCLIParameters": { "_cameraId": "cam1" },
        }),
    )
    .await;
    let (topic, segment) = next(&mut rx).await;
    assert_eq!(topic, "EMS.newSegment");
    assert_eq!(segment["start"].as_f64(), Some(1_000_000.0));
    assert_eq!(segment["cameraId"], "cam1");
    assert_eq!(segment["file"], "/videos/cam1/seg.mp4");

    // The offer completes asynchronously through the event stream
    let offer = tokio::spawn({
        let bus = bus.clone();
        async move {
            bus.publish(
                "EMS.sdp.getOffer",
                vec![json!({ "stunHost": "stun.local:3478" })],
                Some("webrtc"),
            )
            .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    push(
        &mut events,
        "wrtcSDPChanged",
        json!({ "complete": true, "protocolId": 5, "sdp": "v=0\r\n" }),
    )
    .await;

    let offer = tokio::time::timeout(Duration::from_secs(5), offer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(offer, Some(json!({ "sdp": "v=0\r\n", "protocolId": 5 })));

    node.stop().await.unwrap();
    assert!(bridge.event_addr().is_none());
    assert_eq!(bus.subscriber_count("EMS.startRecording"), 0);
}
