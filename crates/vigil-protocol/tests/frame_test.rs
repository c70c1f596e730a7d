// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame encoding/decoding tests for vigil-protocol.

use bytes::Bytes;
use serde_json::json;
use vigil_protocol::frame::{
    Frame, FrameDecoder, FrameError, FramedStream, HEADER_SIZE, read_frame, write_frame,
};
use vigil_protocol::message::IpcMessage;

fn drain(decoder: &mut FrameDecoder) -> Vec<Bytes> {
    let mut out = Vec::new();
    while let Some(frame) = decoder.next_frame().unwrap() {
        out.push(frame.payload);
    }
    out
}

#[test]
fn test_reassembly_with_one_byte_chunks() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let encoded = Frame::new(payload.clone()).unwrap().encode();

    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for byte in encoded.iter() {
        decoder.extend(&[*byte]);
        frames.extend(drain(&mut decoder));
    }

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_ref(), payload.as_slice());
    decoder.finish().unwrap();
}

#[test]
fn test_reassembly_with_uneven_chunks() {
    let first = Frame::json(&json!({"command": "listStreams"})).unwrap();
    let second = Frame::json(&json!({"type": "inStreamCreated", "payload": {"name": "cam1"}}))
        .unwrap();

    let mut wire = first.encode().to_vec();
    wire.extend_from_slice(&second.encode());

    for chunk_size in [1usize, 2, 3, 5, 7, 13, wire.len()] {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            decoder.extend(chunk);
            frames.extend(drain(&mut decoder));
        }

        assert_eq!(frames.len(), 2, "chunk size {chunk_size}");
        assert_eq!(frames[0], first.payload);
        assert_eq!(frames[1], second.payload);
    }
}

#[test]
fn test_back_to_back_frames_in_one_chunk() {
    let mut wire = Frame::new(Bytes::from_static(b"one")).unwrap().encode().to_vec();
    wire.extend_from_slice(&Frame::new(Bytes::from_static(b"two")).unwrap().encode());
    // Start of a third frame that has not fully arrived yet
    wire.extend_from_slice(&[0, 0, 0, 5, b't']);

    let mut decoder = FrameDecoder::new();
    decoder.extend(&wire);
    let frames = drain(&mut decoder);

    assert_eq!(frames, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    assert_eq!(decoder.buffered(), HEADER_SIZE + 1);
    assert!(matches!(
        decoder.finish(),
        Err(FrameError::Truncated { .. })
    ));
}

#[test]
fn test_empty_payload_frame() {
    let mut decoder = FrameDecoder::new();
    decoder.extend(&[0, 0, 0, 0]);

    let frame = decoder.next_frame().unwrap().unwrap();
    assert!(frame.payload.is_empty());
}

#[test]
fn test_decode_incomplete_header() {
    let result = Frame::decode_from_bytes(Bytes::from_static(&[0, 0, 1]));
    assert!(matches!(
        result,
        Err(FrameError::Truncated {
            expected: 4,
            available: 3
        })
    ));
}

#[test]
fn test_decode_incomplete_payload() {
    let mut data = vec![0, 0, 0, 100];
    data.extend_from_slice(&[0u8; 10]);

    let result = Frame::decode_from_bytes(Bytes::from(data));
    assert!(matches!(result, Err(FrameError::Truncated { .. })));
}

#[test]
fn test_malformed_json_payload_is_an_error() {
    let frame = Frame::new(Bytes::from_static(b"{not json")).unwrap();
    let result = frame.decode_json::<serde_json::Value>();

    assert!(matches!(result, Err(FrameError::Json(_))));
}

#[tokio::test]
async fn test_read_write_frame() {
    let msg = IpcMessage::health(1, 1000);
    let original = Frame::json(&msg).unwrap();

    let mut buffer = Vec::new();
    write_frame(&mut buffer, &original).await.unwrap();

    let mut reader = buffer.as_slice();
    let read_back = read_frame(&mut reader).await.unwrap();

    assert_eq!(original, read_back);
    assert_eq!(read_back.decode_json::<IpcMessage>().unwrap(), msg);
}

#[tokio::test]
async fn test_read_frame_on_closed_stream() {
    let mut reader: &[u8] = &[];
    let result = read_frame(&mut reader).await;

    assert!(matches!(result, Err(FrameError::ConnectionClosed)));
}

#[tokio::test]
async fn test_read_frame_truncated_payload() {
    let mut reader: &[u8] = &[0, 0, 0, 8, 1, 2, 3];
    let result = read_frame(&mut reader).await;

    assert!(matches!(result, Err(FrameError::Truncated { .. })));
}

#[tokio::test]
async fn test_framed_stream_json_over_duplex() {
    let (client, server) = tokio::io::duplex(1024);
    let mut client = FramedStream::new(client);
    let mut server = FramedStream::new(server);

    client
        .write_json(&IpcMessage::new("Probe.ready", json!({"pid": 42})))
        .await
        .unwrap();
    let received: IpcMessage = server.read_json().await.unwrap();

    assert_eq!(received.name, "Probe.ready");
    assert_eq!(received.data["pid"], 42);
}

#[tokio::test]
async fn test_framed_stream_reassembles_dribbled_bytes() {
    use tokio::io::AsyncWriteExt;

    let (mut writer, reader) = tokio::io::duplex(64);
    let mut reader = FramedStream::new(reader);

    let mut wire = Frame::json(&json!({"seq": 1})).unwrap().encode().to_vec();
    wire.extend_from_slice(&Frame::json(&json!({"seq": 2})).unwrap().encode());

    tokio::spawn(async move {
        for byte in wire {
            writer.write_all(&[byte]).await.unwrap();
            tokio::task::yield_now().await;
        }
    });

    let first: serde_json::Value = reader.read_json().await.unwrap();
    let second: serde_json::Value = reader.read_json().await.unwrap();
    assert_eq!(first["seq"], 1);
    assert_eq!(second["seq"], 2);
    assert!(matches!(
        reader.read_frame().await,
        Err(FrameError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_framed_stream_splits_coalesced_frames() {
    let mut wire = Vec::new();
    for name in ["one", "two", "three"] {
        wire.extend_from_slice(&Frame::new(name.as_bytes().to_vec()).unwrap().encode());
    }
    let mut reader = FramedStream::new(wire.as_slice());

    for name in ["one", "two", "three"] {
        assert_eq!(reader.read_frame().await.unwrap().payload.as_ref(), name.as_bytes());
    }
}

#[tokio::test]
async fn test_framed_stream_reports_cut_frame() {
    let mut reader = FramedStream::new(&[0u8, 0, 0, 8, 1, 2, 3][..]);

    assert!(matches!(
        reader.read_frame().await,
        Err(FrameError::Truncated {
            expected: 12,
            available: 7
        })
    ));
}
