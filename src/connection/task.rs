//! The connection's background task: reconnect loop, handshake, and the
//! single-task select loop that multiplexes outbound commands, inbound
//! frames, and inflight-expiry timers.
//!
//! Shaped after the outer reconnect loop / inner session loop split this
//! crate's connection handling is modeled on: an outer loop owns backoff
//! and retries; an inner loop owns one live socket until it disconnects.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::Error;
use crate::message::Message;
use crate::options::ConnectionOptions;
use crate::protocol::command::{Command, IdentifyBody, NegotiatedFeatures};
use crate::protocol::frame::{Frame, FrameDecoder, MAGIC_V2};

use super::backoff::Backoff;
use super::inflight::InflightTracker;
use super::state::ConnectionState;
use super::{Envelope, Event, SharedConnectionState};

type Reply = oneshot::Sender<crate::error::Result<Vec<u8>>>;

enum SessionOutcome {
    ClosedByUser,
    Disconnected,
}

/// Entry point spawned by [`super::Connection::connect`].
pub(crate) async fn run(
    host: String,
    port: u16,
    options: ConnectionOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Envelope>,
    state: std::sync::Arc<SharedConnectionState>,
    event_tx: mpsc::UnboundedSender<Event>,
    message_tx: mpsc::UnboundedSender<Message>,
    self_cmd_tx: mpsc::UnboundedSender<Envelope>,
) {
    let mut backoff = Backoff::new(&options);
    let mut subscription: Option<(String, String)> = None;
    let mut last_ready: u32 = 0;

    loop {
        state.set(ConnectionState::Connecting).await;
        let _ = event_tx.send(Event::Connecting);

        match connect_and_identify(&host, port, &options, &state).await {
            Ok((stream, decoder, features)) => {
                log::info!("connected to {host}:{port}, negotiated {features:?}");
                state.set(ConnectionState::Ready).await;
                let _ = event_tx.send(Event::Ready);
                backoff.reset();

                let msg_timeout = features
                    .msg_timeout
                    .map(Duration::from_millis)
                    .unwrap_or(options.msg_timeout);
                let max_msg_timeout = features
                    .max_msg_timeout
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| msg_timeout.saturating_mul(15).max(Duration::from_secs(900)));

                let outcome = run_session(
                    stream,
                    decoder,
                    msg_timeout,
                    max_msg_timeout,
                    &mut cmd_rx,
                    &message_tx,
                    &self_cmd_tx,
                    &mut subscription,
                    &mut last_ready,
                    &state,
                )
                .await;

                match outcome {
                    SessionOutcome::ClosedByUser => {
                        state.set(ConnectionState::Closed).await;
                        let _ = event_tx.send(Event::Closed);
                        return;
                    }
                    SessionOutcome::Disconnected => {
                        log::warn!("disconnected from {host}:{port}");
                        let _ = event_tx.send(Event::Disconnected);
                    }
                }
            }
            Err(e) => {
                log::warn!("connect to {host}:{port} failed: {e}");
            }
        }

        if backoff.exhausted() {
            let msg = "Maximum reconnect attempts exceeded".to_string();
            log::error!("{msg} for {host}:{port}");
            state.set(ConnectionState::Failure(msg.clone())).await;
            let _ = event_tx.send(Event::Failed(msg));
            return;
        }

        let delay = backoff.next_delay();
        let _ = event_tx.send(Event::Reconnecting {
            attempt: backoff.attempts(),
            next_retry: delay,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            envelope = cmd_rx.recv() => {
                match envelope {
                    Some(Envelope::Close) | None => {
                        state.set(ConnectionState::Closed).await;
                        let _ = event_tx.send(Event::Closed);
                        return;
                    }
                    Some(Envelope::Command { reply, .. }) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(Error::Closed));
                        }
                    }
                }
            }
        }
    }
}

async fn connect_and_identify(
    host: &str,
    port: u16,
    options: &ConnectionOptions,
    state: &SharedConnectionState,
) -> crate::error::Result<(TcpStream, FrameDecoder, NegotiatedFeatures)> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    state.set(ConnectionState::Identifying).await;
    stream.write_all(MAGIC_V2).await?;

    let identify = IdentifyBody {
        client_id: options.client_id.clone().unwrap_or_else(local_hostname),
        hostname: options.hostname.clone().unwrap_or_else(local_hostname),
        user_agent: options.user_agent.clone(),
        msg_timeout: options.msg_timeout.as_millis() as u64,
        heartbeat_interval: options
            .heartbeat_interval
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1),
        sample_rate: options.sample_rate,
        output_buffer_size: options.output_buffer_size,
        output_buffer_timeout: options.output_buffer_timeout.map(|d| d.as_millis() as u64),
        feature_negotiation: true,
    };
    stream
        .write_all(&Command::Identify(identify).encode())
        .await?;

    let mut decoder = FrameDecoder::new();
    let identify_response = await_response(&mut stream, &mut decoder).await?;
    let features: NegotiatedFeatures =
        serde_json::from_slice(&identify_response).unwrap_or_default();

    if let Some(secret) = &options.auth_secret {
        stream.write_all(&Command::Auth(secret.clone()).encode()).await?;
        await_response(&mut stream, &mut decoder).await?;
    }

    Ok((stream, decoder, features))
}

/// Read from `stream` until `decoder` yields one `RESPONSE`/`ERROR` frame.
/// Used only during the handshake, before the session loop takes over.
async fn await_response(
    stream: &mut TcpStream,
    decoder: &mut FrameDecoder,
) -> crate::error::Result<Vec<u8>> {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::Protocol("connection closed during handshake".into()));
        }
        let frames = decoder
            .feed(&buf[..n])
            .map_err(|e| Error::Protocol(e.to_string()))?;
        for frame in frames {
            match frame {
                Frame::Response(body) => return Ok(body),
                Frame::Error(body) => {
                    let text = String::from_utf8_lossy(&body).to_string();
                    let code = text.split_whitespace().next().unwrap_or("").to_string();
                    return Err(Error::ServerError { code, message: text });
                }
                Frame::Message(_) => {
                    return Err(Error::Protocol("unexpected MESSAGE during handshake".into()));
                }
            }
        }
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// One queued command awaiting its turn for the single response slot.
struct Deferred {
    cmd: Command,
    reply: Option<Reply>,
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    stream: TcpStream,
    mut decoder: FrameDecoder,
    msg_timeout: Duration,
    max_msg_timeout: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    message_tx: &mpsc::UnboundedSender<Message>,
    self_cmd_tx: &mpsc::UnboundedSender<Envelope>,
    subscription: &mut Option<(String, String)>,
    last_ready: &mut u32,
    state: &SharedConnectionState,
) -> SessionOutcome {
    let (mut reader, mut writer) = stream.into_split();
    let mut inflight = InflightTracker::new();
    let mut pending: Option<Reply> = None;
    let mut deferred: VecDeque<Deferred> = VecDeque::new();
    let mut read_buf = [0u8; 16 * 1024];
    let mut closing = false;
    let mut close_deadline: Option<Instant> = None;

    // Reconnect continuity: resume a prior subscription before releasing
    // the queue to new user commands.
    if let Some((topic, channel)) = subscription.clone() {
        if write_cmd(&mut writer, &Command::Sub { topic, channel }).await.is_err() {
            return SessionOutcome::Disconnected;
        }
        if *last_ready > 0 {
            if write_cmd(&mut writer, &Command::Rdy(*last_ready)).await.is_err() {
                return SessionOutcome::Disconnected;
            }
        }
    }

    loop {
        if closing && inflight.is_empty() {
            return SessionOutcome::ClosedByUser;
        }
        if matches!(close_deadline, Some(d) if Instant::now() >= d) {
            log::warn!("close timed out waiting for {} inflight message(s) to drain", inflight.len());
            return SessionOutcome::ClosedByUser;
        }

        let deadline = match (inflight.next_deadline(), close_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        tokio::select! {
            envelope = cmd_rx.recv() => {
                match envelope {
                    None => return SessionOutcome::Disconnected,
                    Some(Envelope::Close) => {
                        closing = true;
                        close_deadline = Some(Instant::now() + msg_timeout);
                        state.set(ConnectionState::Closing).await;
                        if subscription.is_some() && write_cmd(&mut writer, &Command::Cls).await.is_err() {
                            return SessionOutcome::Disconnected;
                        }
                    }
                    Some(Envelope::Command { cmd, reply }) => {
                        if let Command::Sub { topic, channel } = &cmd {
                            *subscription = Some((topic.clone(), channel.clone()));
                        }
                        if let Command::Rdy(n) = &cmd {
                            *last_ready = *n;
                            if !closing {
                                state.set(if *n == 0 { ConnectionState::Paused } else { ConnectionState::Ready }).await;
                            }
                        }
                        match &cmd {
                            Command::Fin(id) => { inflight.remove(id); }
                            Command::Req { id, .. } => { inflight.remove(id); }
                            Command::Touch(id) => { inflight.touch(id, msg_timeout); }
                            _ => {}
                        }

                        if cmd.needs_response() {
                            if pending.is_some() {
                                deferred.push_back(Deferred { cmd, reply });
                            } else if write_cmd(&mut writer, &cmd).await.is_ok() {
                                pending = reply;
                            } else {
                                if let Some(reply) = reply {
                                    let _ = reply.send(Err(Error::Io(broken_pipe())));
                                }
                                return SessionOutcome::Disconnected;
                            }
                        } else if write_cmd(&mut writer, &cmd).await.is_err() {
                            return SessionOutcome::Disconnected;
                        }
                    }
                }
            }

            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => return SessionOutcome::Disconnected,
                    Ok(n) => {
                        let frames = match decoder.feed(&read_buf[..n]) {
                            Ok(frames) => frames,
                            Err(e) => {
                                log::error!("protocol error: {e}");
                                return SessionOutcome::Disconnected;
                            }
                        };
                        for frame in frames {
                            let outcome = handle_frame(
                                frame, &mut writer, &mut pending, &mut deferred,
                                &mut inflight, msg_timeout, max_msg_timeout, message_tx, self_cmd_tx,
                            ).await;
                            if outcome.is_err() {
                                return SessionOutcome::Disconnected;
                            }
                        }
                    }
                    Err(_) => return SessionOutcome::Disconnected,
                }
            }

            _ = sleep_until_opt(deadline) => {
                for id in inflight.expire_due() {
                    log::debug!("message {id} expired without FIN/REQ/TOUCH");
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending::<()>().await,
    }
}

async fn handle_frame(
    frame: Frame,
    writer: &mut OwnedWriteHalf,
    pending: &mut Option<Reply>,
    deferred: &mut VecDeque<Deferred>,
    inflight: &mut InflightTracker,
    msg_timeout: Duration,
    max_msg_timeout: Duration,
    message_tx: &mpsc::UnboundedSender<Message>,
    self_cmd_tx: &mpsc::UnboundedSender<Envelope>,
) -> std::io::Result<()> {
    match frame {
        Frame::Response(body) => {
            if body == b"_heartbeat_" {
                return write_cmd(writer, &Command::Nop).await;
            }
            if let Some(reply) = pending.take() {
                let _ = reply.send(Ok(body));
            }
            advance_deferred(writer, pending, deferred).await?;
        }
        Frame::Error(body) => {
            let text = String::from_utf8_lossy(&body).to_string();
            let code = text.split_whitespace().next().unwrap_or("").to_string();
            let fatal = !matches!(code.as_str(), "E_FIN_FAILED" | "E_REQ_FAILED" | "E_TOUCH_FAILED");

            if let Some(reply) = pending.take() {
                let _ = reply.send(Err(Error::ServerError {
                    code: code.clone(),
                    message: text.clone(),
                }));
                if !fatal {
                    advance_deferred(writer, pending, deferred).await?;
                }
            } else if !fatal {
                log::warn!("non-fatal async error: {text}");
            }

            if fatal {
                log::error!("fatal server error, closing connection: {text}");
                return Err(std::io::Error::new(std::io::ErrorKind::Other, text));
            }
        }
        Frame::Message(raw) => {
            let id = crate::message::MessageId::from(raw.id);
            inflight.insert(id.clone(), msg_timeout);
            let message = Message::new(
                id,
                raw.timestamp,
                raw.attempts,
                raw.body,
                self_cmd_tx.clone(),
                msg_timeout,
                max_msg_timeout,
            );
            if message_tx.send(message).is_err() {
                log::debug!("message receiver dropped; discarding delivered message");
            }
        }
    }
    Ok(())
}

async fn advance_deferred(
    writer: &mut OwnedWriteHalf,
    pending: &mut Option<Reply>,
    deferred: &mut VecDeque<Deferred>,
) -> std::io::Result<()> {
    if let Some(next) = deferred.pop_front() {
        write_cmd(writer, &next.cmd).await?;
        *pending = next.reply;
    }
    Ok(())
}

async fn write_cmd(writer: &mut OwnedWriteHalf, cmd: &Command) -> std::io::Result<()> {
    writer.write_all(&cmd.encode()).await
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection write failed")
}
