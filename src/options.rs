//! Configuration structs with `Default` impls, in the style of the
//! application `Config` this crate's connection handling grew out of:
//! a plain struct built with struct-update syntax rather than a builder.

use std::time::Duration;

/// Options negotiated with `nsqd` via `IDENTIFY` and local connection policy.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Client identifier sent in `IDENTIFY` (defaults to the local hostname).
    pub client_id: Option<String>,
    /// Hostname sent in `IDENTIFY` (defaults to the local hostname).
    pub hostname: Option<String>,
    /// User agent string sent in `IDENTIFY`.
    pub user_agent: String,
    /// How long `nsqd` should wait before re-queuing an unacked message.
    pub msg_timeout: Duration,
    /// Heartbeat interval requested from `nsqd`. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Optional `IDENTIFY` sample rate (0-99), forwarded verbatim.
    pub sample_rate: Option<u8>,
    /// Optional output buffer size negotiation, forwarded verbatim.
    pub output_buffer_size: Option<i64>,
    /// Optional output buffer timeout negotiation, forwarded verbatim.
    pub output_buffer_timeout: Option<Duration>,
    /// Per-attempt backoff unit: the Nth retry waits
    /// `min(attempt * reconnect_delay_factor, max_reconnect_delay)`.
    pub reconnect_delay_factor: Duration,
    /// Upper bound on the computed backoff delay.
    pub max_reconnect_delay: Duration,
    /// Maximum reconnect attempts before the connection fails terminally.
    /// `None` means retry forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Shared secret sent via `AUTH` immediately after `IDENTIFY`, if set.
    pub auth_secret: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            hostname: None,
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            msg_timeout: Duration::from_secs(60),
            heartbeat_interval: Some(Duration::from_secs(30)),
            sample_rate: None,
            output_buffer_size: None,
            output_buffer_timeout: None,
            reconnect_delay_factor: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(120),
            max_reconnect_attempts: None,
            auth_secret: None,
        }
    }
}

/// Configuration for a [`crate::publisher::Publisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Per-connection options used for the publish connection.
    pub connection: ConnectionOptions,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
        }
    }
}

/// Configuration for a [`crate::subscriber::Subscriber`].
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Per-connection options used for each `nsqd` connection.
    pub connection: ConnectionOptions,
    /// Total number of messages the subscriber keeps in flight across all
    /// connections at once. Distributed across connections as `RDY`.
    pub concurrency: u32,
    /// How often to re-poll `nsqlookupd` for the producer set.
    pub lookup_poll_interval: Duration,
    /// Random jitter applied to each poll so that many subscribers do not
    /// hit `nsqlookupd` in lockstep.
    pub lookup_poll_jitter: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            concurrency: 1,
            lookup_poll_interval: Duration::from_secs(60),
            lookup_poll_jitter: Duration::from_secs(10),
        }
    }
}
