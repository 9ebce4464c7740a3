//! Inbound message type and its handle back to the owning connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::connection::Envelope;
use crate::error::{Error, Result};
use crate::protocol::command::Command;

/// The 16-byte opaque message identifier `nsqd` assigns, carried as its
/// ASCII hex representation (the form `FIN`/`REQ`/`TOUCH` send back).
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A message delivered on a subscribed channel.
///
/// `Message` holds a non-owning handle back to the connection it arrived on
/// (a cloned command-channel sender, not a strong reference to the
/// connection itself) so that `finish`/`requeue`/`touch` can be called
/// without the connection needing to track every outstanding `Message`.
#[derive(Debug)]
pub struct Message {
    /// Opaque identifier used to `FIN`/`REQ`/`TOUCH` this message.
    pub id: MessageId,
    /// `nsqd` timestamp, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Number of times `nsqd` has attempted delivery, including this one.
    pub attempts: u16,
    /// Raw message payload.
    pub body: Vec<u8>,
    handle: mpsc::UnboundedSender<Envelope>,
    msg_timeout: Duration,
    max_msg_timeout: Duration,
    finished: Arc<AtomicBool>,
}

impl Message {
    pub(crate) fn new(
        id: MessageId,
        timestamp: i64,
        attempts: u16,
        body: Vec<u8>,
        handle: mpsc::UnboundedSender<Envelope>,
        msg_timeout: Duration,
        max_msg_timeout: Duration,
    ) -> Self {
        Self {
            id,
            timestamp,
            attempts,
            body,
            handle,
            msg_timeout,
            max_msg_timeout,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Decode the body as JSON, for producers that publish JSON payloads.
    /// Callers that publish raw bytes should read `body` directly instead.
    pub fn body_json<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Acknowledge successful processing. `nsqd` will not redeliver this id.
    pub fn finish(&self) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        self.send(Command::Fin(self.id.clone()))
    }

    /// Re-queue the message, optionally after `delay` before redelivery.
    pub fn requeue(&self, delay: Option<Duration>) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        let timeout_ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.send(Command::Req {
            id: self.id.clone(),
            timeout_ms,
        })
    }

    /// Reset `nsqd`'s processing timeout for this message without
    /// finishing or requeuing it.
    pub fn touch(&self) -> Result<()> {
        self.send(Command::Touch(self.id.clone()))
    }

    /// Spawn a background task that periodically `TOUCH`es this message so
    /// long-running handlers don't lose it to `msg_timeout`.
    ///
    /// Each cycle sleeps for `msg_timeout - keepalive_offset` (floored at
    /// 1ms) before sending `TOUCH`. The task stops on its own once `finish`
    /// or `requeue` has been called, once the connection handle is closed,
    /// or once another cycle would push the message past `max_msg_timeout`
    /// since delivery — `nsqd` itself refuses to extend beyond that bound.
    /// Dropping the returned handle without awaiting it also stops the loop.
    pub fn keepalive(&self, keepalive_offset: Duration) -> tokio::task::JoinHandle<()> {
        let finished = self.finished.clone();
        let handle = self.handle.clone();
        let id = self.id.clone();
        let interval = self
            .msg_timeout
            .checked_sub(keepalive_offset)
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_millis(1));
        let msg_timeout = self.msg_timeout;
        let max_msg_timeout = self.max_msg_timeout;

        tokio::spawn(async move {
            let mut elapsed = Duration::ZERO;
            loop {
                tokio::time::sleep(interval).await;
                elapsed += interval;
                if finished.load(Ordering::Relaxed) {
                    return;
                }
                if elapsed + msg_timeout > max_msg_timeout {
                    log::debug!("message {id} reached max_msg_timeout; stopping keepalive");
                    return;
                }
                if handle
                    .send(Envelope::Command {
                        cmd: Command::Touch(id.clone()),
                        reply: None,
                    })
                    .is_err()
                {
                    return;
                }
            }
        })
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.handle
            .send(Envelope::Command { cmd, reply: None })
            .map_err(|_| Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_message(id: &str, body: Vec<u8>, handle: mpsc::UnboundedSender<Envelope>) -> Message {
        Message::new(
            MessageId::from(id),
            0,
            1,
            body,
            handle,
            Duration::from_secs(60),
            Duration::from_secs(900),
        )
    }

    #[test]
    fn body_json_decodes_structured_payload() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let msg = test_message("abc", br#"{"order_id":42}"#.to_vec(), tx);
        #[derive(serde::Deserialize)]
        struct Order {
            order_id: u32,
        }
        let decoded: Order = msg.body_json().unwrap();
        assert_eq!(decoded.order_id, 42);
    }

    #[test]
    fn finish_fails_once_handle_is_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let msg = test_message("abc", vec![], tx);
        assert!(matches!(msg.finish(), Err(Error::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_touches_until_finished() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let msg = test_message("abc", vec![], tx);
        let handle = msg.keepalive(Duration::from_secs(10));

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(
            envelope,
            Envelope::Command {
                cmd: Command::Touch(_),
                ..
            }
        ));

        msg.finish().unwrap();
        rx.recv().await.unwrap(); // the FIN from finish()
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
