//! Wire-level tests against an in-process fake `nsqd`: handshake, PUB round
//! trip, heartbeat reply, message delivery + FIN, and fatal-error-driven
//! reconnect.

mod support;

use std::time::Duration;

use nsq_client::{Connection, ConnectionOptions, Event};
use support::FakeNsqd;

fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        msg_timeout: Duration::from_secs(5),
        heartbeat_interval: Some(Duration::from_secs(30)),
        reconnect_delay_factor: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: Some(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn pub_round_trip() {
    let server = FakeNsqd::bind().await;
    let host = server.host();
    let port = server.port();

    let server_task = tokio::spawn(async move {
        let mut session = server.accept(b"{}").await;
        let line = session.read_line().await;
        assert_eq!(line, "PUB orders");
        let body = session.read_body().await;
        assert_eq!(body, br#"{"some":"object"}"#);
        session.send_response(b"OK").await;
        session
    });

    let (conn, _events, _messages) = Connection::connect(host, port, fast_options())
        .await
        .unwrap();
    conn.publish("orders", br#"{"some":"object"}"#.to_vec())
        .await
        .unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn heartbeat_is_answered_with_nop() {
    let server = FakeNsqd::bind().await;
    let host = server.host();
    let port = server.port();

    let server_task = tokio::spawn(async move {
        let mut session = server.accept(b"{}").await;
        session.send_heartbeat().await;
        let line = session.read_line().await;
        assert_eq!(line, "NOP");
        session
    });

    let (_conn, _events, _messages) = Connection::connect(host, port, fast_options())
        .await
        .unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn message_delivery_then_fin_clears_inflight() {
    let server = FakeNsqd::bind().await;
    let host = server.host();
    let port = server.port();
    let id = *b"0123456789abcdef";

    let server_task = tokio::spawn(async move {
        let mut session = server.accept(b"{}").await;
        let line = session.read_line().await;
        assert_eq!(line, "SUB orders billing");
        session.send_response(b"OK").await;

        session.send_message(1_700_000_000_000_000_000, 1, &id, b"hello").await;

        let line = session.read_line().await;
        assert_eq!(line, format!("FIN {}", hex(&id)));
        session
    });

    let (conn, _events, mut messages) = Connection::connect(host, port, fast_options())
        .await
        .unwrap();
    conn.subscribe("orders", "billing").await.unwrap();

    let message = messages.recv().await.unwrap();
    assert_eq!(message.body, b"hello");
    message.finish().unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn fatal_server_error_triggers_reconnect() {
    let server = FakeNsqd::bind().await;
    let host = server.host();
    let port = server.port();

    let server_task = tokio::spawn(async move {
        let mut session = server.accept(b"{}").await;
        let line = session.read_line().await;
        assert_eq!(line, "PUB orders");
        session.read_body().await;
        session.send_error(b"E_INVALID bad body").await;
        session.disconnect();

        // Reconnect continuity: accept the retry and let it go Ready.
        let _second = server.accept(b"{}").await;
    });

    let (conn, mut events, _messages) = Connection::connect(host, port, fast_options())
        .await
        .unwrap();

    let err = conn.publish("orders", b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, nsq_client::Error::ServerError { code, .. } if code == "E_INVALID"));

    let mut saw_disconnected = false;
    let mut saw_ready_again = false;
    for _ in 0..6 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Event::Disconnected => saw_disconnected = true,
            Event::Ready if saw_disconnected => {
                saw_ready_again = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_disconnected, "expected a Disconnected event");
    assert!(saw_ready_again, "expected a Ready event after reconnecting");

    server_task.await.unwrap();
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for b in bytes {
        write!(out, "{b:02x}").unwrap();
    }
    out
}
