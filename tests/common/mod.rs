//! A scripted nsqd used by the integration tests.
//!
//! It reads the client's text commands line by line and writes
//! size-prefixed frames back, so tests can assert on the exact command
//! sequence a client produces.
#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

pub const STEP: Duration = Duration::from_secs(5);

/// Pad `prefix` with `0` up to a 16 byte nsqd message id.
pub fn id(prefix: &str) -> [u8; 16] {
    let padded = format!("{:0<16}", prefix);
    padded.as_bytes().try_into().expect("prefix longer than 16 bytes")
}

pub fn id_str(prefix: &str) -> String {
    String::from_utf8(id(prefix).to_vec()).unwrap()
}

/// `[size][type][data]`
pub fn frame_bytes(frame_type: u32, data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u32(4 + data.len() as u32);
    buf.put_u32(frame_type);
    buf.extend_from_slice(data);
    buf
}

/// Message frame payload: `[timestamp][attempts][id][body]`
pub fn message_data(id: &[u8; 16], attempts: u16, timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(26 + body.len());
    data.put_i64(timestamp);
    data.put_u16(attempts);
    data.extend_from_slice(id);
    data.extend_from_slice(body);
    data
}

pub struct FakeNsqd<T> {
    io: BufReader<T>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> FakeNsqd<T> {
    pub fn new(io: T) -> Self {
        Self {
            io: BufReader::new(io),
        }
    }

    pub async fn expect_magic(&mut self) {
        let mut magic = [0u8; 4];
        tokio::time::timeout(STEP, self.io.read_exact(&mut magic))
            .await
            .expect("timed out waiting for magic")
            .expect("read magic");
        assert_eq!(&magic, b"  V2");
    }

    /// Next command line without its trailing LF; empty string on EOF.
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(STEP, self.io.read_line(&mut line))
            .await
            .expect("timed out waiting for a command")
            .expect("read command");
        line.trim_end_matches('\n').to_string()
    }

    pub async fn read_u32(&mut self) -> u32 {
        self.io.read_u32().await.expect("read u32")
    }

    /// A `[u32 size][bytes]` body.
    pub async fn read_body(&mut self) -> Vec<u8> {
        let len = self.read_u32().await as usize;
        let mut body = vec![0u8; len];
        self.io.read_exact(&mut body).await.expect("read body");
        body
    }

    pub async fn send_frame(&mut self, frame_type: u32, data: &[u8]) {
        let buf = frame_bytes(frame_type, data);
        self.io.write_all(&buf).await.expect("write frame");
        self.io.flush().await.expect("flush");
    }

    pub async fn heartbeat(&mut self) {
        self.send_frame(0, b"_heartbeat_").await;
    }

    pub async fn ok(&mut self) {
        self.send_frame(0, b"OK").await;
    }

    pub async fn error(&mut self, text: &str) {
        self.send_frame(1, text.as_bytes()).await;
    }

    pub async fn message(&mut self, id: [u8; 16], attempts: u16, body: &[u8]) {
        let data = message_data(&id, attempts, 1_700_000_000_000_000_000, body);
        self.send_frame(2, &data).await;
    }
}
