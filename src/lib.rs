//! Async client for the [NSQ](https://nsq.io) distributed message broker.
//!
//! Speaks the NSQ TCP protocol v2 to `nsqd` nodes directly, and polls
//! `nsqlookupd` over HTTP for topic discovery. Two roles sit atop a shared
//! [`Connection`](connection::Connection) core:
//!
//! - [`publisher::Publisher`] — sends messages to a single `nsqd`.
//! - [`subscriber::Subscriber`] — receives messages from one or more `nsqd`
//!   nodes for a `(topic, channel)` pair, either via a direct address or a
//!   dynamically discovered producer set.
//!
//! TLS, SNAPPY/DEFLATE compression, and exactly-once delivery are out of
//! scope — NSQ itself is at-least-once, and this client does not negotiate
//! either transport feature.

pub mod connection;
pub mod error;
pub mod lookup;
pub mod message;
pub mod options;
pub mod protocol;
pub mod publisher;
pub mod subscriber;
pub mod uri;

pub use connection::{Connection, ConnectionState, Event};
pub use error::{Error, Result};
pub use message::{Message, MessageId};
pub use options::{ConnectionOptions, PublisherConfig, SubscriberConfig};
pub use publisher::{PublishBody, Publisher};
pub use subscriber::{Subscriber, SubscriberEvent, SubscriberMessage};
