//! Wire frame types and the incremental decoder.
//!
//! Every frame `nsqd` sends is `[u32 BE size][u32 BE frame_type][body]`,
//! where `size` counts the type field plus the body (`4 + body.len()`).
//! `MESSAGE` frames carry a further fixed header ahead of the payload.

use anyhow::{bail, Result};
use bytes::BytesMut;

/// Magic bytes sent once, immediately after the TCP connection opens.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Sanity cap on a single frame's size, to bound memory use against a
/// misbehaving or confused peer.
const MAX_FRAME_SIZE: u32 = 32 * 1024 * 1024;

mod frame_type {
    pub const RESPONSE: u32 = 0;
    pub const ERROR: u32 = 1;
    pub const MESSAGE: u32 = 2;
}

/// A decoded frame from `nsqd`.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A plain `RESPONSE` frame, e.g. `OK` or `_heartbeat_`.
    Response(Vec<u8>),
    /// An `ERROR` frame: `<code> <message>` as ASCII, e.g. `E_INVALID ...`.
    Error(Vec<u8>),
    /// A `MESSAGE` frame delivering one message on a subscribed channel.
    Message(RawMessage),
}

/// The fixed-format body of a `MESSAGE` frame, before `Message` construction.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Nanoseconds since the Unix epoch, as set by `nsqd`.
    pub timestamp: i64,
    /// Delivery attempt counter, starting at 1.
    pub attempts: u16,
    /// 16-byte opaque id, kept as hex ASCII (its wire form).
    pub id: String,
    /// Message payload.
    pub body: Vec<u8>,
}

/// Incremental frame decoder: accumulates bytes across `feed` calls and
/// extracts every complete frame available, leaving a partial frame
/// buffered for the next call. Backed by `BytesMut` so a complete frame is
/// split off in O(1) rather than shifting the remaining bytes down, the way
/// `Vec::drain` would.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Feed newly read bytes and return every complete frame they produced.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let size = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
            if size < 4 {
                bail!("nsq frame: size {size} smaller than the type field");
            }
            if size > MAX_FRAME_SIZE {
                bail!("nsq frame too large: {size} bytes");
            }
            let total = 4 + size as usize;
            if self.buf.len() < total {
                break;
            }

            let frame = self.buf.split_to(total);
            let frame_type = u32::from_be_bytes(frame[4..8].try_into().unwrap());
            frames.push(decode_frame(frame_type, &frame[8..total])?);
        }

        Ok(frames)
    }
}

fn decode_frame(frame_type: u32, body: &[u8]) -> Result<Frame> {
    match frame_type {
        frame_type::RESPONSE => Ok(Frame::Response(body.to_vec())),
        frame_type::ERROR => Ok(Frame::Error(body.to_vec())),
        frame_type::MESSAGE => Ok(Frame::Message(decode_message(body)?)),
        other => bail!("unknown nsq frame type: {other}"),
    }
}

const MESSAGE_HEADER_LEN: usize = 8 + 2 + 16;

fn decode_message(body: &[u8]) -> Result<RawMessage> {
    if body.len() < MESSAGE_HEADER_LEN {
        bail!(
            "MESSAGE frame too short: {} bytes, expected >= {}",
            body.len(),
            MESSAGE_HEADER_LEN
        );
    }
    let timestamp = i64::from_be_bytes(body[0..8].try_into().unwrap());
    let attempts = u16::from_be_bytes(body[8..10].try_into().unwrap());
    let id = hex_encode(&body[10..26]);
    let payload = body[26..].to_vec();
    Ok(RawMessage {
        timestamp,
        attempts,
        id,
        body: payload,
    })
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

/// Encode a full frame's bytes, used only by the in-process fake server in
/// tests — real `nsqd` instances are the only thing that ever writes a
/// `MESSAGE` or server `RESPONSE`/`ERROR` frame in production.
#[cfg(test)]
pub fn encode_frame(frame_type: u32, body: &[u8]) -> Vec<u8> {
    let size = 4 + body.len() as u32;
    let mut buf = Vec::with_capacity(4 + body.len() + 4);
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&frame_type.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

#[cfg(test)]
pub fn encode_message_frame(timestamp: i64, attempts: u16, id: &[u8; 16], payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(MESSAGE_HEADER_LEN + payload.len());
    body.extend_from_slice(&timestamp.to_be_bytes());
    body.extend_from_slice(&attempts.to_be_bytes());
    body.extend_from_slice(id);
    body.extend_from_slice(payload);
    encode_frame(frame_type::MESSAGE, &body)
}
