//! Minimal in-process fake `nsqd`, driven frame-by-frame by the test that
//! owns it. Plays the same role `broker/integration_test_full.rs` gives a
//! real `UnixStream` pair in the teacher repo: exercise the wire protocol
//! end-to-end instead of mocking the socket.

#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct FakeNsqd {
    listener: TcpListener,
}

impl FakeNsqd {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn host(&self) -> String {
        self.listener.local_addr().unwrap().ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accept the next connection, consume the magic bytes and `IDENTIFY`,
    /// and reply with `identify_response` as the negotiated-features JSON.
    pub async fn accept(&self, identify_response: &[u8]) -> FakeSession {
        let (stream, _) = self.listener.accept().await.unwrap();
        stream.set_nodelay(true).unwrap();
        let mut session = FakeSession { stream };
        session.expect_magic().await;
        session.read_line().await; // "IDENTIFY"
        session.read_body().await;
        session.send_response(identify_response).await;
        session
    }
}

pub struct FakeSession {
    stream: TcpStream,
}

impl FakeSession {
    async fn expect_magic(&mut self) {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"  V2");
    }

    /// Read one newline-terminated command line (without the `\n`).
    pub async fn read_line(&mut self) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    /// Read a 4-byte BE length prefix followed by that many body bytes.
    pub async fn read_body(&mut self) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.unwrap();
        body
    }

    pub async fn send_response(&mut self, body: &[u8]) {
        self.send_frame(0, body).await;
    }

    pub async fn send_error(&mut self, body: &[u8]) {
        self.send_frame(1, body).await;
    }

    pub async fn send_message(&mut self, timestamp: i64, attempts: u16, id: &[u8; 16], payload: &[u8]) {
        let mut body = Vec::with_capacity(26 + payload.len());
        body.extend_from_slice(&timestamp.to_be_bytes());
        body.extend_from_slice(&attempts.to_be_bytes());
        body.extend_from_slice(id);
        body.extend_from_slice(payload);
        self.send_frame(2, &body).await;
    }

    pub async fn send_heartbeat(&mut self) {
        self.send_response(b"_heartbeat_").await;
    }

    async fn send_frame(&mut self, frame_type: u32, body: &[u8]) {
        let size = 4 + body.len() as u32;
        let mut buf = Vec::with_capacity(8 + body.len());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&frame_type.to_be_bytes());
        buf.extend_from_slice(body);
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Drop the underlying socket, simulating a server-side disconnect.
    pub fn disconnect(self) {
        drop(self.stream);
    }
}
