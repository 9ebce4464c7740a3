//! A single connection to one `nsqd` instance: handshake, command queue,
//! inflight tracking, heartbeats, and reconnect — the core this crate
//! builds everything else on top of.

mod backoff;
mod inflight;
mod state;
mod task;

pub use backoff::Backoff;
pub use inflight::InflightTracker;
pub use state::ConnectionState;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::ConnectionOptions;
use crate::protocol::command::Command;

/// A unit of work sent to the connection task: either a command (possibly
/// awaiting a response) or a request to close gracefully.
#[derive(Debug)]
pub(crate) enum Envelope {
    /// Send `cmd`. If `reply` is `Some`, the task resolves it with the
    /// `RESPONSE`/`ERROR` body once received.
    Command {
        cmd: Command,
        reply: Option<oneshot::Sender<Result<Vec<u8>>>>,
    },
    /// Begin the close protocol: `CLS` (if subscribed), drain inflight,
    /// then stop.
    Close,
}

/// Lifecycle and connection-scoped events, delivered asynchronously.
#[derive(Debug, Clone)]
pub enum Event {
    /// TCP connect + handshake in progress.
    Connecting,
    /// Handshake complete; the connection may now be used.
    Ready,
    /// The socket dropped unexpectedly; a reconnect will follow unless
    /// attempts are exhausted.
    Disconnected,
    /// About to retry after `Disconnected`.
    Reconnecting {
        /// Which attempt this is (1-based).
        attempt: u32,
        /// Delay before the attempt starts.
        next_retry: Duration,
    },
    /// Reconnect attempts exhausted, or an unrecoverable protocol error.
    /// Terminal — no further events follow except nothing.
    Failed(String),
    /// `close()` completed; the socket is released. Terminal.
    Closed,
    /// A non-fatal server error unrelated to a waiting caller (e.g. an
    /// asynchronous `E_FIN_FAILED` for an id that already expired).
    Error(String),
}

/// Shared, externally observable connection state, following the same
/// read/write-lock-behind-an-Arc shape used elsewhere in this crate for
/// cross-task state.
#[derive(Debug, Default)]
struct SharedConnectionState {
    state: RwLock<ConnectionState>,
}

impl SharedConnectionState {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn get(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    async fn set(&self, new_state: ConnectionState) {
        *self.state.write().await = new_state;
    }
}

/// A handle to one `nsqd` connection. Cheap to clone; every clone talks to
/// the same underlying connection task.
#[derive(Debug, Clone)]
pub struct Connection {
    host: String,
    port: u16,
    cmd_tx: mpsc::UnboundedSender<Envelope>,
    shared_state: Arc<SharedConnectionState>,
}

impl Connection {
    /// Open a connection to `host:port`, spawning the background task that
    /// owns the socket and runs the reconnect loop. Returns immediately;
    /// the task begins connecting in the background.
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        options: ConnectionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>, mpsc::UnboundedReceiver<Message>)> {
        let host = host.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let shared_state = SharedConnectionState::new();

        let conn = Self {
            host: host.clone(),
            port,
            cmd_tx: cmd_tx.clone(),
            shared_state: shared_state.clone(),
        };

        tokio::spawn(task::run(
            host,
            port,
            options,
            cmd_rx,
            shared_state,
            event_tx,
            message_tx,
            cmd_tx,
        ));

        Ok((conn, event_rx, message_rx))
    }

    /// The `nsqd` host this connection targets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The `nsqd` TCP port this connection targets.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.shared_state.get().await
    }

    /// Subscribe this connection to `topic`/`channel`. Must be called
    /// before the first `ready()` call.
    pub async fn subscribe(&self, topic: impl Into<String>, channel: impl Into<String>) -> Result<()> {
        self.call(Command::Sub {
            topic: topic.into(),
            channel: channel.into(),
        })
        .await
        .map(|_| ())
    }

    /// Authenticate with `nsqd --auth-http-address` deployments.
    pub async fn auth(&self, secret: impl Into<String>) -> Result<()> {
        self.call(Command::Auth(secret.into())).await.map(|_| ())
    }

    /// Publish a single message to `topic`. Returns the `RESPONSE` body
    /// `nsqd` sends back, normally `"OK"`.
    pub async fn publish(&self, topic: impl Into<String>, body: Vec<u8>) -> Result<String> {
        self.call(Command::Pub {
            topic: topic.into(),
            body,
        })
        .await
        .map(decode_response)
    }

    /// Publish many messages to `topic` in a single round trip. Returns the
    /// `RESPONSE` body `nsqd` sends back, normally `"OK"`.
    pub async fn publish_many(&self, topic: impl Into<String>, bodies: Vec<Vec<u8>>) -> Result<String> {
        self.call(Command::Mpub {
            topic: topic.into(),
            bodies,
        })
        .await
        .map(decode_response)
    }

    /// Publish a single message to `topic`, deferred by `delay`. Rejected
    /// synchronously, without touching the wire, if `delay` cannot be
    /// represented in whole milliseconds. Returns the `RESPONSE` body
    /// `nsqd` sends back, normally `"OK"`.
    pub async fn publish_deferred(
        &self,
        topic: impl Into<String>,
        body: Vec<u8>,
        delay: Duration,
    ) -> Result<String> {
        let delay_ms = u64::try_from(delay.as_millis()).map_err(|_| {
            Error::InvalidInvocation("delay exceeds the range DPUB can represent".into())
        })?;
        self.call(Command::Dpub {
            topic: topic.into(),
            delay_ms,
            body,
        })
        .await
        .map(decode_response)
    }

    /// Update the number of messages this connection is willing to receive.
    /// Fire-and-forget: does not wait on a server reply.
    pub fn ready(&self, count: u32) -> Result<()> {
        self.send(Command::Rdy(count))
    }

    /// Begin a graceful close: if subscribed, sends `CLS` and waits for
    /// inflight messages to drain (bounded by `msg_timeout`) before the
    /// socket is released.
    pub fn close(&self) -> Result<()> {
        self.cmd_tx.send(Envelope::Close).map_err(|_| Error::Closed)
    }

    async fn call(&self, cmd: Command) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Envelope::Command {
                cmd,
                reply: Some(reply_tx),
            })
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(Envelope::Command { cmd, reply: None })
            .map_err(|_| Error::Closed)
    }
}

/// Decode a `RESPONSE` body as the ASCII string `nsqd` sends (`"OK"`, etc).
fn decode_response(body: Vec<u8>) -> String {
    String::from_utf8_lossy(&body).into_owned()
}
