use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Message, MessageType};

/// Maximum payload size (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 12;

const MAGIC: [u8; 2] = [0x46, 0x50];
const TYPE_OFFSET: usize = 2;
const CHANNEL_OFFSET: usize = 4;
const LEN_OFFSET: usize = 8;

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Bad frame magic: {0:#04x} {1:#04x}")]
    BadMagic(u8, u8),

    #[error("Payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    #[error("Message handler failed: {0}")]
    Handler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A raw frame as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub channel: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: u16, channel: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            channel,
            payload: payload.into(),
        }
    }

    /// A frame without payload
    pub fn empty(msg_type: u16, channel: u32) -> Self {
        Self::new(msg_type, channel, Bytes::new())
    }

    /// A frame whose payload is the UTF-8 JSON form of `value`
    pub fn json<T: Serialize>(msg_type: u16, channel: u32, value: &T) -> Result<Self, CodecError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(msg_type, channel, payload))
    }

    /// Total encoded size including the header
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Codec for the tunnel frame envelope
///
/// Wire format:
/// ```text
/// +-------+-------+-----------+--------------+-------------+---------------+
/// | 0x46  | 0x50  | type (u16 | channel (u32 | length (u32 | payload       |
/// |       |       | LE)       | LE)          | LE)         | (length bytes)|
/// +-------+-------+-----------+--------------+-------------+---------------+
/// ```
///
/// Decoding only ever consumes complete frames from the front of the buffer, so
/// partially received headers or payloads stay in place until the next read.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Magic can be checked as soon as the first two bytes arrive
        if src.len() >= 2 && (src[0] != MAGIC[0] || src[1] != MAGIC[1]) {
            return Err(CodecError::BadMagic(src[0], src[1]));
        }
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let msg_type = u16::from_le_bytes([src[TYPE_OFFSET], src[TYPE_OFFSET + 1]]);
        let channel = u32::from_le_bytes([
            src[CHANNEL_OFFSET],
            src[CHANNEL_OFFSET + 1],
            src[CHANNEL_OFFSET + 2],
            src[CHANNEL_OFFSET + 3],
        ]);
        let length = u32::from_le_bytes([
            src[LEN_OFFSET],
            src[LEN_OFFSET + 1],
            src[LEN_OFFSET + 2],
            src[LEN_OFFSET + 3],
        ]) as usize;

        if length > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(length));
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        let frame = Frame {
            msg_type,
            channel,
            payload,
        };
        log_frame(&frame, false);
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(item.payload.len()));
        }

        dst.reserve(item.encoded_len());
        dst.put_slice(&MAGIC);
        dst.put_u16_le(item.msg_type);
        dst.put_u32_le(item.channel);
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_slice(&item.payload);

        log_frame(&item, true);
        Ok(())
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.into_frame()?;
        Encoder::<Frame>::encode(self, frame, dst)
    }
}

/// Stateful decoder that accepts arbitrarily sliced input
///
/// Only the undelivered remainder of the stream is retained between calls.
/// Any error resets the receiver; the caller is expected to close the transport.
#[derive(Debug, Default)]
pub struct MessageReceiver {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl MessageReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every frame it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();
        self.receive(chunk, |frame| {
            frames.push(frame);
            Ok::<_, std::convert::Infallible>(())
        })?;
        Ok(frames)
    }

    /// Feed a chunk and hand every completed frame to `handler`, in arrival order
    ///
    /// A handler error aborts decoding exactly like a framing violation.
    pub fn receive<F, E>(&mut self, chunk: &[u8], mut handler: F) -> Result<(), CodecError>
    where
        F: FnMut(Frame) -> Result<(), E>,
        E: std::fmt::Display,
    {
        self.buffer.extend_from_slice(chunk);
        loop {
            let frame = match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            };
            if let Err(e) = handler(frame) {
                self.reset();
                return Err(CodecError::Handler(e.to_string()));
            }
        }
    }

    /// Number of buffered bytes not yet delivered
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer = BytesMut::new();
    }
}

fn log_frame(frame: &Frame, outbound: bool) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let direction = if outbound { "out" } else { "in" };
    let name = MessageType::name_of(frame.msg_type);
    if frame.payload.is_empty() {
        tracing::debug!("[msg-{} {} {}] - empty", direction, name, frame.channel);
    } else if MessageType::is_binary(frame.msg_type) {
        tracing::debug!(
            "[msg-{} {} {}] - {} payload bytes",
            direction,
            name,
            frame.channel,
            frame.payload.len()
        );
    } else {
        tracing::debug!(
            "[msg-{} {} {}] {}",
            direction,
            name,
            frame.channel,
            String::from_utf8_lossy(&frame.payload)
        );
    }
}
