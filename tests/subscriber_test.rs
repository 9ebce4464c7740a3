//! Subscriber controller: direct-mode subscribe + RDY assignment, and
//! lookup-mode producer discovery that tolerates a broken lookup host.

mod support;

use std::time::Duration;

use nsq_client::{Subscriber, SubscriberConfig, SubscriberEvent};
use support::FakeNsqd;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> SubscriberConfig {
    SubscriberConfig {
        connection: nsq_client::ConnectionOptions {
            reconnect_delay_factor: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
            ..Default::default()
        },
        concurrency: 1,
        lookup_poll_interval: Duration::from_millis(50),
        lookup_poll_jitter: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn direct_subscribe_gets_rdy_and_fins_delivered_messages() {
    let server = FakeNsqd::bind().await;
    let host = server.host();
    let port = server.port();
    let id_a = *b"0000000000000001";
    let id_b = *b"0000000000000002";

    let server_task = tokio::spawn(async move {
        let mut session = server.accept(b"{}").await;
        let line = session.read_line().await;
        assert_eq!(line, "SUB orders billing");
        session.send_response(b"OK").await;

        let line = session.read_line().await;
        assert_eq!(line, "RDY 1");

        session.send_message(1, 1, &id_a, b"a").await;
        let line = session.read_line().await;
        assert_eq!(line, format!("FIN {}", hex(&id_a)));

        session.send_message(2, 1, &id_b, b"b").await;
        let line = session.read_line().await;
        assert_eq!(line, format!("FIN {}", hex(&id_b)));
    });

    let (_subscriber, mut messages, _events) =
        Subscriber::connect_direct("orders", "billing", host, port, config())
            .await
            .unwrap();

    let first = messages.recv().await.unwrap();
    assert_eq!(first.message.body, b"a");
    first.message.finish().unwrap();

    let second = messages.recv().await.unwrap();
    assert_eq!(second.message.body, b"b");
    second.message.finish().unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn lookup_poll_tolerates_a_broken_host_and_adds_the_healthy_one() {
    let nsqd = FakeNsqd::bind().await;
    let nsqd_host = nsqd.host();
    let nsqd_port = nsqd.port();

    let nsqd_task = tokio::spawn(async move {
        let mut session = nsqd.accept(b"{}").await;
        let line = session.read_line().await;
        assert_eq!(line, "SUB orders billing");
        session.send_response(b"OK").await;
        session.read_line().await; // RDY 1
        session
    });

    let broken_lookup = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken_lookup)
        .await;

    let healthy_lookup = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "producers": [{"broadcast_address": nsqd_host, "tcp_port": nsqd_port}],
        })))
        .mount(&healthy_lookup)
        .await;

    let (_subscriber, _messages, mut events) = Subscriber::connect_lookup(
        "orders",
        "billing",
        vec![broken_lookup.uri(), healthy_lookup.uri()],
        config(),
    )
    .await
    .unwrap();

    let mut saw_lookup_error = false;
    let mut saw_added = false;
    for _ in 0..20 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SubscriberEvent::LookupError { .. } => saw_lookup_error = true,
            SubscriberEvent::Added { port, .. } if port == nsqd_port => saw_added = true,
            _ => {}
        }
        if saw_lookup_error && saw_added {
            break;
        }
    }

    assert!(saw_lookup_error, "expected the broken lookup host to surface an error");
    assert!(saw_added, "expected the healthy lookup host's producer to be added");

    nsqd_task.await.unwrap();
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for b in bytes {
        write!(out, "{b:02x}").unwrap();
    }
    out
}
