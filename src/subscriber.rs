//! Subscriber controller: maintains the connection set for a `(topic,
//! channel)` pair and redistributes the `RDY` budget across it.
//!
//! Two producer sources are supported, matching the teacher's split between
//! a single always-on link and a dynamically discovered set
//! (`channel/action_cable.rs`'s reconnect loop vs. `hub/mod.rs`'s peer
//! roster): a direct `(host, port)`, or one or more `nsqlookupd` bases
//! polled on an interval. Both funnel through the same connection-set
//! bookkeeping and `RDY` distribution.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection::{Connection, Event as ConnectionEvent};
use crate::error::{Error, Result};
use crate::lookup::LookupClient;
use crate::message::Message;
use crate::options::SubscriberConfig;

/// A message delivered by one of the subscriber's connections, tagged with
/// the `nsqd` it arrived from.
#[derive(Debug)]
pub struct SubscriberMessage {
    /// Broadcast address of the `nsqd` this message was delivered by.
    pub host: String,
    /// TCP port of that `nsqd`.
    pub port: u16,
    /// The delivered message.
    pub message: Message,
}

/// Lifecycle and housekeeping events surfaced by a [`Subscriber`].
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// A new producer connection was added to the set.
    Added { host: String, port: u16 },
    /// A producer dropped out of the discovered set (or the direct
    /// connection closed) and was removed.
    Removed { host: String, port: u16 },
    /// A per-connection lifecycle event, tagged with its producer.
    Connection {
        host: String,
        port: u16,
        event: ConnectionEvent,
    },
    /// A lookup poll cycle started.
    PollBegin,
    /// A lookup poll cycle finished (producer set updated, RDY redistributed).
    PollComplete,
    /// A single `nsqlookupd` host failed during a poll. Non-fatal; the poll
    /// continues with whatever other hosts returned.
    LookupError { host: String, error: String },
}

enum ControlMsg {
    Pause,
    Unpause,
    Close,
}

enum Internal {
    ConnEvent(String, ConnectionEvent),
    ConnMessage(String, Message),
}

/// Handle to a running subscriber. Cloning shares the same controller task.
#[derive(Debug, Clone)]
pub struct Subscriber {
    control_tx: mpsc::UnboundedSender<ControlMsg>,
}

type ConnectReceivers = (
    Subscriber,
    mpsc::UnboundedReceiver<SubscriberMessage>,
    mpsc::UnboundedReceiver<SubscriberEvent>,
);

impl Subscriber {
    /// Subscribe to a single `nsqd` directly, without `nsqlookupd`.
    pub async fn connect_direct(
        topic: impl Into<String>,
        channel: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        config: SubscriberConfig,
    ) -> Result<ConnectReceivers> {
        let topic = topic.into();
        let channel = channel.into();
        let host = host.into();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(
            topic,
            channel,
            config,
            Producers::Fixed(vec![crate::lookup::Producer {
                broadcast_address: host,
                tcp_port: port,
            }]),
            control_rx,
            message_tx,
            event_tx,
        ));

        Ok((Self { control_tx }, message_rx, event_rx))
    }

    /// Subscribe via one or more `nsqlookupd` bases, polled on
    /// `config.lookup_poll_interval` for the producer set.
    pub async fn connect_lookup(
        topic: impl Into<String>,
        channel: impl Into<String>,
        lookup_bases: Vec<String>,
        config: SubscriberConfig,
    ) -> Result<ConnectReceivers> {
        if lookup_bases.is_empty() {
            return Err(Error::InvalidInvocation(
                "at least one nsqlookupd base is required".into(),
            ));
        }
        let topic = topic.into();
        let channel = channel.into();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(
            topic.clone(),
            channel,
            config,
            Producers::Lookup(LookupClient::new(lookup_bases), topic),
            control_rx,
            message_tx,
            event_tx,
        ));

        Ok((Self { control_tx }, message_rx, event_rx))
    }

    /// Set effective concurrency to zero; every connection's `RDY` drops to
    /// zero on the next redistribution.
    pub fn pause(&self) -> Result<()> {
        self.control_tx
            .send(ControlMsg::Pause)
            .map_err(|_| Error::Closed)
    }

    /// Restore the configured concurrency.
    pub fn unpause(&self) -> Result<()> {
        self.control_tx
            .send(ControlMsg::Unpause)
            .map_err(|_| Error::Closed)
    }

    /// Close every connection in the set. If a lookup poll is in progress,
    /// the controller finishes it before tearing down.
    pub fn close(&self) -> Result<()> {
        self.control_tx
            .send(ControlMsg::Close)
            .map_err(|_| Error::Closed)
    }
}

enum Producers {
    Fixed(Vec<crate::lookup::Producer>),
    Lookup(LookupClient, String),
}

struct ConnEntry {
    connection: Connection,
    ready: u32,
    last_message_at: Instant,
}

#[allow(clippy::too_many_arguments)]
async fn run(
    topic: String,
    channel: String,
    config: SubscriberConfig,
    producers: Producers,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    message_tx: mpsc::UnboundedSender<SubscriberMessage>,
    event_tx: mpsc::UnboundedSender<SubscriberEvent>,
) {
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();
    let mut entries: HashMap<String, ConnEntry> = HashMap::new();
    let mut paused = false;

    match &producers {
        Producers::Fixed(fixed) => {
            for producer in fixed {
                add_producer(
                    producer,
                    &topic,
                    &channel,
                    &config,
                    &mut entries,
                    &internal_tx,
                    &event_tx,
                )
                .await;
            }
            distribute_ready(&mut entries, effective_concurrency(&config, paused));
        }
        Producers::Lookup(..) => {
            // First poll happens inside the loop below so `PollBegin`/
            // `PollComplete` fire consistently for every cycle, including
            // the first.
        }
    }

    let mut next_poll = Instant::now();

    loop {
        let poll_delay = match &producers {
            Producers::Lookup(..) => Some(next_poll.saturating_duration_since(Instant::now())),
            Producers::Fixed(_) => None,
        };

        tokio::select! {
            control = control_rx.recv() => {
                match control {
                    None | Some(ControlMsg::Close) => break,
                    Some(ControlMsg::Pause) => {
                        paused = true;
                        distribute_ready(&mut entries, effective_concurrency(&config, paused));
                    }
                    Some(ControlMsg::Unpause) => {
                        paused = false;
                        distribute_ready(&mut entries, effective_concurrency(&config, paused));
                    }
                }
            }

            internal = internal_rx.recv() => {
                match internal {
                    None => {}
                    Some(Internal::ConnEvent(addr, event)) => {
                        if let Ok((host, port)) = split_addr(&addr) {
                            let _ = event_tx.send(SubscriberEvent::Connection { host, port, event });
                        }
                    }
                    Some(Internal::ConnMessage(addr, message)) => {
                        if let Some(entry) = entries.get_mut(&addr) {
                            entry.last_message_at = Instant::now();
                        }
                        if let Ok((host, port)) = split_addr(&addr) {
                            let _ = message_tx.send(SubscriberMessage { host, port, message });
                        }
                    }
                }
            }

            _ = sleep_opt(poll_delay) => {
                if let Producers::Lookup(client, topic_name) = &producers {
                    let _ = event_tx.send(SubscriberEvent::PollBegin);
                    let (found, errors) = client.poll_with_errors(topic_name).await;
                    for (host, error) in errors {
                        let _ = event_tx.send(SubscriberEvent::LookupError { host, error });
                    }
                    reconcile_producers(
                        &found,
                        &topic,
                        &channel,
                        &config,
                        &mut entries,
                        &internal_tx,
                        &event_tx,
                    )
                    .await;
                    distribute_ready(&mut entries, effective_concurrency(&config, paused));
                    let _ = event_tx.send(SubscriberEvent::PollComplete);
                    next_poll = Instant::now() + poll_interval_with_jitter(&config);
                }
            }
        }
    }

    for (addr, entry) in entries.drain() {
        let _ = entry.connection.close();
        if let Ok((host, port)) = split_addr(&addr) {
            let _ = event_tx.send(SubscriberEvent::Removed { host, port });
        }
    }
}

fn effective_concurrency(config: &SubscriberConfig, paused: bool) -> u32 {
    if paused {
        0
    } else {
        config.concurrency
    }
}

fn poll_interval_with_jitter(config: &SubscriberConfig) -> Duration {
    let jitter_ms = config.lookup_poll_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::random::<u64>() % jitter_ms)
    };
    config.lookup_poll_interval + jitter
}

async fn sleep_opt(delay: Option<Duration>) {
    match delay {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

fn split_addr(addr: &str) -> std::result::Result<(String, u16), ()> {
    let (host, port) = addr.rsplit_once(':').ok_or(())?;
    let port: u16 = port.parse().map_err(|_| ())?;
    Ok((host.to_string(), port))
}

async fn add_producer(
    producer: &crate::lookup::Producer,
    topic: &str,
    channel: &str,
    config: &SubscriberConfig,
    entries: &mut HashMap<String, ConnEntry>,
    internal_tx: &mpsc::UnboundedSender<Internal>,
    event_tx: &mpsc::UnboundedSender<SubscriberEvent>,
) {
    let addr = format!("{}:{}", producer.broadcast_address, producer.tcp_port);
    let connect = Connection::connect(
        producer.broadcast_address.clone(),
        producer.tcp_port,
        config.connection.clone(),
    )
    .await;

    let (connection, mut conn_event_rx, mut conn_message_rx) = match connect {
        Ok(c) => c,
        Err(e) => {
            log::warn!("failed to connect to producer {addr}: {e}");
            return;
        }
    };

    if let Err(e) = connection.subscribe(topic, channel).await {
        log::warn!("SUB failed for producer {addr}: {e}");
        let _ = connection.close();
        return;
    }

    let forward_addr = addr.clone();
    let forward_tx = internal_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = conn_event_rx.recv().await {
            if forward_tx
                .send(Internal::ConnEvent(forward_addr.clone(), event))
                .is_err()
            {
                break;
            }
        }
    });
    let forward_addr = addr.clone();
    let forward_tx = internal_tx.clone();
    tokio::spawn(async move {
        while let Some(message) = conn_message_rx.recv().await {
            if forward_tx
                .send(Internal::ConnMessage(forward_addr.clone(), message))
                .is_err()
            {
                break;
            }
        }
    });

    entries.insert(
        addr.clone(),
        ConnEntry {
            connection,
            ready: 0,
            last_message_at: Instant::now(),
        },
    );
    if let Ok((host, port)) = split_addr(&addr) {
        let _ = event_tx.send(SubscriberEvent::Added { host, port });
    }
}

async fn reconcile_producers(
    found: &[crate::lookup::Producer],
    topic: &str,
    channel: &str,
    config: &SubscriberConfig,
    entries: &mut HashMap<String, ConnEntry>,
    internal_tx: &mpsc::UnboundedSender<Internal>,
    event_tx: &mpsc::UnboundedSender<SubscriberEvent>,
) {
    let desired: HashSet<String> = found
        .iter()
        .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port))
        .collect();

    let stale: Vec<String> = entries
        .keys()
        .filter(|addr| !desired.contains(*addr))
        .cloned()
        .collect();
    for addr in stale {
        if let Some(entry) = entries.remove(&addr) {
            let _ = entry.connection.close();
        }
        if let Ok((host, port)) = split_addr(&addr) {
            let _ = event_tx.send(SubscriberEvent::Removed { host, port });
        }
    }

    for producer in found {
        let addr = format!("{}:{}", producer.broadcast_address, producer.tcp_port);
        if !entries.contains_key(&addr) {
            add_producer(
                producer, topic, channel, config, entries, internal_tx, event_tx,
            )
            .await;
        }
    }
}

/// Apply the RDY distribution policy (spec §4.5) to `entries`, sending a
/// `RDY` command to every connection whose target differs from its current
/// value.
fn distribute_ready(entries: &mut HashMap<String, ConnEntry>, concurrency: u32) {
    let n = entries.len();
    if n == 0 {
        return;
    }

    let snapshot: Vec<(String, u32, Instant)> = entries
        .iter()
        .map(|(addr, e)| (addr.clone(), e.ready, e.last_message_at))
        .collect();
    let targets = compute_ready_targets(&snapshot, concurrency);

    for (addr, target) in targets {
        if let Some(entry) = entries.get_mut(&addr) {
            if entry.ready != target {
                if let Err(e) = entry.connection.ready(target) {
                    log::warn!("failed to send RDY {target} to {addr}: {e}");
                    continue;
                }
                entry.ready = target;
            }
        }
    }
}

/// Pure RDY-distribution math, factored out of [`distribute_ready`] so it
/// can be tested without a real `Connection`.
fn compute_ready_targets(
    entries: &[(String, u32, Instant)],
    concurrency: u32,
) -> HashMap<String, u32> {
    let n = entries.len();
    if n == 0 {
        return HashMap::new();
    }

    if concurrency == 0 {
        return entries.iter().map(|(addr, ..)| (addr.clone(), 0)).collect();
    }

    if concurrency as usize >= n {
        let per = concurrency / n as u32;
        return entries.iter().map(|(addr, ..)| (addr.clone(), per)).collect();
    }

    let c = concurrency as usize;
    let mut targets: HashMap<String, u32> = entries
        .iter()
        .map(|(addr, ready, _)| (addr.clone(), *ready))
        .collect();

    let mut used: Vec<&(String, u32, Instant)> = entries.iter().filter(|(_, r, _)| *r > 0).collect();
    let mut unused: Vec<&(String, u32, Instant)> = entries.iter().filter(|(_, r, _)| *r == 0).collect();
    used.sort_by_key(|(_, _, t)| *t);
    unused.sort_by_key(|(_, _, t)| *t);

    for (addr, ..) in unused.iter().take(c) {
        targets.insert(addr.clone(), 1);
    }
    for (addr, ..) in used.iter().take(unused.len()) {
        targets.insert(addr.clone(), 0);
    }

    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: &str, ready: u32, age_ms: u64, base: Instant) -> (String, u32, Instant) {
        (addr.to_string(), ready, base + Duration::from_millis(age_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_at_least_connections_floors_without_remainder() {
        let base = Instant::now();
        let entries = vec![
            entry("a:1", 0, 0, base),
            entry("b:1", 0, 0, base),
            entry("c:1", 0, 0, base),
        ];
        let targets = compute_ready_targets(&entries, 7);
        assert_eq!(targets["a:1"], 2);
        assert_eq!(targets["b:1"], 2);
        assert_eq!(targets["c:1"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_below_connections_rotates_the_idle_slot() {
        let base = Instant::now();
        // Round 1: both idle, never delivered a message. "a" is the least
        // recently active (same instant here; insertion order breaks the
        // tie via a stable sort), so it gets the one RDY slot.
        let round1 = vec![entry("a:1", 0, 0, base), entry("b:1", 0, 0, base)];
        let targets1 = compute_ready_targets(&round1, 1);
        assert_eq!(targets1["a:1"], 1);
        assert_eq!(targets1["b:1"], 0);

        // Round 2: "a" became used and more recently active than "b" is
        // not possible here (b never ran); simulate a's ready=1 and a more
        // recent last_message_at than b's untouched baseline.
        let round2 = vec![
            entry("a:1", 1, 1_000, base),
            entry("b:1", 0, 0, base),
        ];
        let targets2 = compute_ready_targets(&round2, 1);
        assert_eq!(targets2["b:1"], 1);
        assert_eq!(targets2["a:1"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_concurrency_pauses_every_connection() {
        let base = Instant::now();
        let entries = vec![entry("a:1", 3, 0, base), entry("b:1", 2, 0, base)];
        let targets = compute_ready_targets(&entries, 0);
        assert_eq!(targets["a:1"], 0);
        assert_eq!(targets["b:1"], 0);
    }

    #[test]
    fn split_addr_parses_host_and_port() {
        assert_eq!(
            split_addr("10.0.0.1:4150").unwrap(),
            ("10.0.0.1".to_string(), 4150)
        );
        assert!(split_addr("no-port").is_err());
    }
}
