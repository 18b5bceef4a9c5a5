//! Packet framing
//!
//! The proxy itself never looks at bytes; it works on [`Packet`]s. A
//! [`PacketCodec`] turns frames into packets for a given connection phase.
//! The bundled codec speaks newline-delimited JSON, one packet object per
//! line, with the packet kind under `"kind"`.

use crate::error::CodecError;
use crate::packet::{Packet, RawPacket};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest accepted frame in bytes
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Connection phase; decides which packet kinds can appear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Login,
    Play,
}

pub trait PacketCodec: Send + Sync {
    fn decode(&self, phase: Phase, frame: &[u8]) -> Result<Packet, CodecError>;

    fn encode(&self, phase: Phase, packet: &Packet) -> Result<Vec<u8>, CodecError>;
}

pub type SharedCodec = Arc<dyn PacketCodec>;

/// Newline-delimited JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl PacketCodec for JsonCodec {
    fn decode(&self, phase: Phase, frame: &[u8]) -> Result<Packet, CodecError> {
        let raw: RawPacket = serde_json::from_slice(frame)?;
        // Entity-bearing kinds only exist in play; a malformed one stays generic
        match phase {
            Phase::Play => Ok(Packet::from(raw)),
            Phase::Handshake | Phase::Login => Ok(Packet::Other(raw)),
        }
    }

    fn encode(&self, _phase: Phase, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let raw = packet.clone().into_raw()?;
        let mut bytes = serde_json::to_vec(&raw)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Reads packets off a byte stream.
///
/// `next` is cancel safe: a partially read frame stays buffered.
pub struct PacketReader<R> {
    inner: BufReader<R>,
    codec: SharedCodec,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R, codec: SharedCodec) -> Self {
        Self {
            inner: BufReader::new(inner),
            codec,
            buf: Vec::new(),
        }
    }

    /// Next packet, or `None` once the peer has closed the stream.
    ///
    /// A frame that grows past [`MAX_FRAME_SIZE`] without a newline fails
    /// with [`CodecError::TooLarge`] as soon as the limit is crossed.
    pub async fn next(&mut self, phase: Phase) -> Result<Option<Packet>, CodecError> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                // A trailing partial frame is discarded
                return Ok(None);
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let take = newline.map_or(available.len(), |i| i + 1);
            let size = self.buf.len() + take;
            if newline.is_none() && size > MAX_FRAME_SIZE {
                self.buf.clear();
                return Err(CodecError::TooLarge {
                    size,
                    max: MAX_FRAME_SIZE,
                });
            }
            self.buf.extend_from_slice(&available[..take]);
            self.inner.consume(take);
            if newline.is_none() {
                continue;
            }

            let frame = std::mem::take(&mut self.buf);
            let trimmed = trim_line(&frame);
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.len() > MAX_FRAME_SIZE {
                return Err(CodecError::TooLarge {
                    size: trimmed.len(),
                    max: MAX_FRAME_SIZE,
                });
            }
            return self.codec.decode(phase, trimmed).map(Some);
        }
    }

    /// Next packet, treating end of stream as an error
    pub async fn expect(&mut self, phase: Phase, expected: &str) -> Result<Packet, CodecError> {
        self.next(phase).await?.ok_or_else(|| CodecError::Closed {
            expected: expected.to_string(),
        })
    }
}

/// Writes packets to a byte stream
pub struct PacketWriter<W> {
    inner: W,
    codec: SharedCodec,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W, codec: SharedCodec) -> Self {
        Self { inner, codec }
    }

    pub async fn send(&mut self, phase: Phase, packet: &Packet) -> Result<(), CodecError> {
        let bytes = self.codec.encode(phase, packet)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shorthand for sending a generic packet
    pub async fn send_raw(&mut self, phase: Phase, raw: RawPacket) -> Result<(), CodecError> {
        self.send(phase, &Packet::Other(raw)).await
    }

    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

fn trim_line(frame: &[u8]) -> &[u8] {
    let mut end = frame.len();
    while end > 0 && (frame[end - 1] == b'\n' || frame[end - 1] == b'\r') {
        end -= 1;
    }
    &frame[..end]
}
