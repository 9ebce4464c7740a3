//! Single-connection façade for `PUB`/`MPUB`/`DPUB`.

use std::time::Duration;

use crate::connection::{Connection, Event};
use crate::error::{Error, Result};
use crate::options::PublisherConfig;

/// A handle that publishes messages to one `nsqd` over a single connection.
///
/// Cheap to clone; every clone shares the same underlying connection and
/// its reconnect/backoff state.
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Connection,
}

/// Body accepted by [`Publisher::publish`]: either a single payload or a
/// batch, each coerced the way the wire codec coerces command bodies (raw
/// bytes verbatim, strings as UTF-8, anything `Serialize` as JSON).
#[derive(Debug)]
pub enum PublishBody {
    /// A single message.
    One(Vec<u8>),
    /// Several messages sent in one `MPUB` round trip.
    Many(Vec<Vec<u8>>),
}

impl From<Vec<u8>> for PublishBody {
    fn from(body: Vec<u8>) -> Self {
        Self::One(body)
    }
}

impl From<&str> for PublishBody {
    fn from(body: &str) -> Self {
        Self::One(body.as_bytes().to_vec())
    }
}

impl From<String> for PublishBody {
    fn from(body: String) -> Self {
        Self::One(body.into_bytes())
    }
}

impl From<Vec<Vec<u8>>> for PublishBody {
    fn from(bodies: Vec<Vec<u8>>) -> Self {
        Self::Many(bodies)
    }
}

impl Publisher {
    /// Open a connection to `host:port` for publishing.
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        config: PublisherConfig,
    ) -> Result<(Self, tokio::sync::mpsc::UnboundedReceiver<Event>)> {
        let (connection, event_rx, message_rx) =
            Connection::connect(host, port, config.connection).await?;
        // A Publisher never subscribes, so no MESSAGE frame should ever
        // arrive on this connection; drop the receiver so the connection
        // task's unbounded channel doesn't grow without bound in that case.
        drop(message_rx);
        Ok((Self { connection }, event_rx))
    }

    /// Publish `data` to `topic`. Serializes any JSON-serializable value via
    /// [`PublishBody`]'s `From` impls, or call [`Publisher::publish_body`]
    /// directly with a pre-built [`PublishBody`]. Returns the `RESPONSE`
    /// string `nsqd` sends back, normally `"OK"`.
    pub async fn publish(&self, topic: impl Into<String>, data: impl Into<PublishBody>) -> Result<String> {
        self.publish_body(topic, data.into(), None).await
    }

    /// Publish `data` to `topic`, deferred by `delay` before `nsqd` makes it
    /// available to consumers. Rejects synchronously, without touching the
    /// wire, if `data` is a batch — `nsqd` has no deferred multi-publish.
    /// Returns the `RESPONSE` string `nsqd` sends back, normally `"OK"`.
    pub async fn publish_delayed(
        &self,
        topic: impl Into<String>,
        data: impl Into<PublishBody>,
        delay: Duration,
    ) -> Result<String> {
        self.publish_body(topic, data.into(), Some(delay)).await
    }

    /// Publish many identical or distinct payloads to `topic` in one
    /// `MPUB` round trip. Returns the `RESPONSE` string `nsqd` sends back,
    /// normally `"OK"`.
    pub async fn publish_many(&self, topic: impl Into<String>, bodies: Vec<Vec<u8>>) -> Result<String> {
        self.connection.publish_many(topic, bodies).await
    }

    async fn publish_body(
        &self,
        topic: impl Into<String>,
        body: PublishBody,
        delay: Option<Duration>,
    ) -> Result<String> {
        match (body, delay) {
            (PublishBody::Many(_), Some(_)) => Err(Error::InvalidInvocation(
                "Cannot delay a multi publish".into(),
            )),
            (PublishBody::Many(bodies), None) => self.connection.publish_many(topic, bodies).await,
            (PublishBody::One(body), Some(delay)) => {
                self.connection.publish_deferred(topic, body, delay).await
            }
            (PublishBody::One(body), None) => self.connection.publish(topic, body).await,
        }
    }

    /// Current lifecycle state of the underlying connection.
    pub async fn state(&self) -> crate::connection::ConnectionState {
        self.connection.state().await
    }

    /// Close the underlying connection.
    pub fn close(&self) -> Result<()> {
        self.connection.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_bodies_are_encoded_before_reaching_publish_body() {
        #[derive(serde::Serialize)]
        struct Order {
            id: u32,
        }
        let value = serde_json::to_vec(&Order { id: 1 }).unwrap();
        let body: PublishBody = value.clone().into();
        assert!(matches!(body, PublishBody::One(b) if b == value));
    }

    #[test]
    fn many_bodies_become_a_batch() {
        let body: PublishBody = vec![b"a".to_vec(), b"b".to_vec()].into();
        assert!(matches!(body, PublishBody::Many(b) if b.len() == 2));
    }
}
