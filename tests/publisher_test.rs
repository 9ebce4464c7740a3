//! Publisher façade: command selection and synchronous rejection paths
//! that never touch the wire.

mod support;

use std::time::Duration;

use nsq_client::{Error, Publisher, PublisherConfig};
use support::FakeNsqd;

#[tokio::test]
async fn delay_plus_multi_publish_rejects_without_writing_to_the_wire() {
    let server = FakeNsqd::bind().await;
    let host = server.host();
    let port = server.port();

    let server_task = tokio::spawn(async move {
        server.accept(b"{}").await
        // No further reads: the test asserts nothing more is ever sent.
    });

    let (publisher, _events) = Publisher::connect(host, port, PublisherConfig::default())
        .await
        .unwrap();

    let err = publisher
        .publish_delayed(
            "orders",
            vec![b"a".to_vec(), b"b".to_vec()],
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInvocation(msg) if msg == "Cannot delay a multi publish"));

    server_task.await.unwrap();
}

#[tokio::test]
async fn invalid_dpub_reports_e_invalid_and_then_reconnects() {
    // §4.3 classifies only E_REQ_FAILED/E_FIN_FAILED/E_TOUCH_FAILED as
    // non-fatal; every other ERROR frame (including a bad-body E_INVALID
    // here) half-closes the socket and triggers reconnect — see DESIGN.md's
    // note on this vs. scenario 4's "connection remains usable" wording.
    let server = FakeNsqd::bind().await;
    let host = server.host();
    let port = server.port();

    let server_task = tokio::spawn(async move {
        let mut session = server.accept(b"{}").await;
        let line = session.read_line().await;
        assert!(line.starts_with("DPUB orders"));
        session.read_body().await;
        session.send_error(b"E_INVALID DPUB invalid delay").await;
        session.disconnect();

        let mut session = server.accept(b"{}").await;
        let line = session.read_line().await;
        assert_eq!(line, "PUB orders");
        session.read_body().await;
        session.send_response(b"OK").await;
    });

    let (publisher, _events) = Publisher::connect(
        host,
        port,
        PublisherConfig {
            connection: nsq_client::ConnectionOptions {
                reconnect_delay_factor: Duration::from_millis(10),
                max_reconnect_delay: Duration::from_millis(50),
                ..Default::default()
            },
        },
    )
    .await
    .unwrap();

    let err = publisher
        .publish_delayed("orders", b"x".to_vec(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServerError { code, .. } if code.starts_with("E_INVALID")));

    // Retrying immediately races the reconnect; give it a moment, same as a
    // real caller would after observing the first publish fail.
    tokio::time::sleep(Duration::from_millis(200)).await;
    publisher.publish("orders", b"x".to_vec()).await.unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn mpub_fan_out_sends_message_count_and_bodies() {
    let server = FakeNsqd::bind().await;
    let host = server.host();
    let port = server.port();

    let server_task = tokio::spawn(async move {
        let mut session = server.accept(b"{}").await;
        let line = session.read_line().await;
        assert_eq!(line, "MPUB t");
        let body = session.read_body().await;
        let count = u32::from_be_bytes(body[0..4].try_into().unwrap());
        assert_eq!(count, 2);
        session.send_response(b"OK").await;
    });

    let (publisher, _events) = Publisher::connect(host, port, PublisherConfig::default())
        .await
        .unwrap();
    publisher
        .publish("t", vec![b"a".to_vec(), b"a".to_vec()])
        .await
        .unwrap();

    server_task.await.unwrap();
}
