// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for length-prefixed framing.
//!
//! Every message on a vigil byte stream has the following layout:
//! - 4 bytes: payload length `L` (big-endian, unsigned)
//! - `L` bytes: payload (JSON-encoded envelope, opaque to this layer)
//!
//! Transports may deliver arbitrary chunks. [`FramedStream`] feeds whatever
//! each read returns into a [`FrameDecoder`], which reassembles complete
//! frames and keeps any remainder for the next one. [`read_frame`] is the
//! one-shot variant for readers that carry exactly one frame at a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes requested from the transport per read
const READ_CHUNK: usize = 8 * 1024;

/// Maximum frame size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (4 bytes length)
pub const HEADER_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("truncated frame: expected {expected} bytes, stream ended after {available}")]
    Truncated { expected: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A single framed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from raw payload bytes
    pub fn new(payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self { payload })
    }

    /// Create a frame carrying a JSON-encoded value
    pub fn json<T: Serialize>(value: &T) -> Result<Self, FrameError> {
        Self::new(serde_json::to_vec(value)?)
    }

    /// Decode the payload as JSON
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode exactly one frame from a complete buffer
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let length = bytes.get_u32() as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE + length,
                available: HEADER_SIZE + bytes.len(),
            });
        }

        Ok(Self {
            payload: bytes.split_to(length),
        })
    }
}

/// Incremental decoder for streams that deliver partial chunks.
///
/// A frame is only yielded once `4 + L` bytes are buffered; anything past the
/// end of that frame is retained for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk received from the transport
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let payload = self.buffer.split_to(length).freeze();
        Ok(Some(Frame { payload }))
    }

    /// Signal end of stream; leftover bytes mean the last frame was cut short
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let expected = if self.buffer.len() >= HEADER_SIZE {
            HEADER_SIZE
                + u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize
        } else {
            HEADER_SIZE
        };
        Err(FrameError::Truncated {
            expected,
            available: self.buffer.len(),
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE + length,
                available: HEADER_SIZE,
            });
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Frame {
        payload: Bytes::from(payload),
    })
}

/// Framed codec for reading and writing JSON frames on a stream
pub struct FramedStream<S> {
    stream: S,
    decoder: FrameDecoder,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream.
    ///
    /// Cancel safe: bytes already received stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }

            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                self.decoder.finish()?;
                return Err(FrameError::ConnectionClosed);
            }
            self.decoder.extend(&chunk[..read]);
        }
    }

    /// Read the next frame and decode it as JSON
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        self.read_frame().await?.decode_json()
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Encode a value as JSON and write it as one frame
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), FrameError> {
        let frame = Frame::json(value)?;
        self.write_frame(&frame).await
    }
}
