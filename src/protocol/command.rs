//! NSQ v2 text commands and their wire encoding.
//!
//! Most commands are a single newline-terminated ASCII line. A handful carry
//! a length-prefixed binary body after the line (`PUB`, `MPUB`, `DPUB`,
//! `IDENTIFY`, `AUTH`). See [`Command::encode`].

use serde::{Deserialize, Serialize};

use crate::message::MessageId;

/// A single NSQ protocol command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Handshake body, sent once immediately after the `"  V2"` magic.
    Identify(IdentifyBody),
    /// Authenticate with `nsqd --auth-http-address`.
    Auth(String),
    /// Subscribe to `topic`/`channel`. Only valid before the first `RDY`.
    Sub { topic: String, channel: String },
    /// Publish a single message to `topic`.
    Pub { topic: String, body: Vec<u8> },
    /// Publish many messages to `topic` in one round trip.
    Mpub { topic: String, bodies: Vec<Vec<u8>> },
    /// Publish a single message to `topic`, deferred by `delay_ms`.
    Dpub {
        topic: String,
        delay_ms: u64,
        body: Vec<u8>,
    },
    /// Update the number of messages this connection is willing to receive.
    Rdy(u32),
    /// Acknowledge successful processing of a message.
    Fin(MessageId),
    /// Re-queue a message, optionally after `timeout_ms`.
    Req { id: MessageId, timeout_ms: u64 },
    /// Reset a message's processing timeout without finishing it.
    Touch(MessageId),
    /// Begin a graceful close: stop delivery, let inflight messages drain.
    Cls,
    /// Keepalive reply to a server heartbeat.
    Nop,
}

/// `IDENTIFY` request body, serialized as JSON per the wire protocol.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyBody {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub msg_timeout: u64,
    pub heartbeat_interval: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_timeout: Option<u64>,
    pub feature_negotiation: bool,
}

/// Features `nsqd` negotiates back in the `IDENTIFY` `RESPONSE` body. Every
/// field is optional because older `nsqd` releases omit some of them; a
/// missing field falls back to what the client requested.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NegotiatedFeatures {
    /// `msg_timeout` `nsqd` will actually enforce, in milliseconds.
    pub msg_timeout: Option<u64>,
    /// Upper bound a `TOUCH` can push `msg_timeout` out to, in milliseconds.
    pub max_msg_timeout: Option<u64>,
    /// Maximum `RDY` count this `nsqd` accepts from one connection.
    pub max_rdy_count: Option<u64>,
    #[serde(default)]
    pub tls_v1: bool,
    #[serde(default)]
    pub snappy: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default)]
    pub auth_required: bool,
}

impl Command {
    /// True if `nsqd` answers this command with a `RESPONSE`/`ERROR` frame
    /// that must be matched to the caller before the next such command is
    /// sent. `RDY`/`FIN`/`REQ`/`TOUCH`/`CLS`/`NOP` are fire-and-forget: they
    /// may still produce an asynchronous `ERROR` frame later, but nothing
    /// waits on it.
    pub fn needs_response(&self) -> bool {
        matches!(
            self,
            Command::Identify(_)
                | Command::Auth(_)
                | Command::Sub { .. }
                | Command::Pub { .. }
                | Command::Mpub { .. }
                | Command::Dpub { .. }
        )
    }

    /// Encode this command to the bytes written to the socket.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Identify(body) => {
                let json = serde_json::to_vec(body).expect("IdentifyBody serialization cannot fail");
                encode_line_with_body(b"IDENTIFY", &json)
            }
            Command::Auth(secret) => encode_line_with_body(b"AUTH", secret.as_bytes()),
            Command::Sub { topic, channel } => {
                encode_line(&format!("SUB {topic} {channel}"))
            }
            Command::Pub { topic, body } => {
                encode_line_with_body(format!("PUB {topic}").as_bytes(), body)
            }
            Command::Mpub { topic, bodies } => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&(bodies.len() as u32).to_be_bytes());
                for body in bodies {
                    payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
                    payload.extend_from_slice(body);
                }
                encode_line_with_body(format!("MPUB {topic}").as_bytes(), &payload)
            }
            Command::Dpub {
                topic,
                delay_ms,
                body,
            } => encode_line_with_body(format!("DPUB {topic} {delay_ms}").as_bytes(), body),
            Command::Rdy(count) => encode_line(&format!("RDY {count}")),
            Command::Fin(id) => encode_line(&format!("FIN {id}")),
            Command::Req { id, timeout_ms } => encode_line(&format!("REQ {id} {timeout_ms}")),
            Command::Touch(id) => encode_line(&format!("TOUCH {id}")),
            Command::Cls => encode_line("CLS"),
            Command::Nop => encode_line("NOP"),
        }
    }
}

fn encode_line(line: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    buf
}

fn encode_line_with_body(line: &[u8], body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(line.len() + 1 + 4 + body.len());
    buf.extend_from_slice(line);
    buf.push(b'\n');
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}
