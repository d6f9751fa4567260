//! Connection behaviour over an in-memory transport.

mod common;

use bytes::Bytes;
use iridium_nsq::{ClientConfig, Command, Connection, ConnectionState, Endpoint, Frame};
use std::time::Duration;
use tokio::io::{DuplexStream, duplex};
use tokio::time::timeout;

use common::{FakeNsqd, STEP, id_str};

fn pipe() -> (Connection, FakeNsqd<DuplexStream>) {
    let (client_io, broker_io) = duplex(64 * 1024);
    let conn = Connection::from_transport(
        Endpoint::new("a", 4150),
        client_io,
        &ClientConfig::default(),
    );
    (conn, FakeNsqd::new(broker_io))
}

#[tokio::test]
async fn magic_precedes_commands_in_issue_order() {
    let (conn, mut nsqd) = pipe();
    conn.send(Command::Pub {
        topic: "t".into(),
        body: Bytes::from_static(b"one"),
    })
    .await
    .unwrap();
    conn.send(Command::Nop).await.unwrap();

    nsqd.expect_magic().await;
    assert_eq!(nsqd.read_line().await, "PUB t");
    assert_eq!(nsqd.read_body().await, b"one");
    assert_eq!(nsqd.read_line().await, "NOP");
}

#[tokio::test]
async fn heartbeat_without_subscription_is_answered() {
    let (_conn, mut nsqd) = pipe();
    nsqd.expect_magic().await;
    nsqd.ok().await;
    nsqd.error("E_BAD_TOPIC").await;
    nsqd.heartbeat().await;
    assert_eq!(nsqd.read_line().await, "NOP");
}

#[tokio::test]
async fn attached_subscription_receives_frames() {
    let (conn, mut nsqd) = pipe();
    nsqd.expect_magic().await;
    let mut frames = conn.attach("t", "c").await.expect("attach");

    nsqd.message(common::id("m1"), 1, b"hi").await;
    nsqd.heartbeat().await;

    match timeout(STEP, frames.recv()).await.unwrap() {
        Some(Frame::Message(m)) => {
            assert_eq!(m.id.to_string(), id_str("m1"));
            assert_eq!(&m.body[..], b"hi");
        }
        other => panic!("expected message, got {:?}", other),
    }
    assert_eq!(
        timeout(STEP, frames.recv()).await.unwrap(),
        Some(Frame::Heartbeat)
    );
}

#[tokio::test]
async fn broker_hangup_marks_connection_failed() {
    let (conn, mut nsqd) = pipe();
    nsqd.expect_magic().await;
    let mut frames = conn.attach("t", "c").await.expect("attach");
    drop(nsqd);

    timeout(STEP, conn.wait_for_state(ConnectionState::Failed))
        .await
        .expect("state change")
        .expect("task alive long enough to report");
    // the route is dropped, ending any subscription loop
    assert_eq!(timeout(STEP, frames.recv()).await.unwrap(), None);

    let err = conn.send(Command::Nop).await.unwrap_err();
    assert!(err.to_string().contains("transport error"));
}

#[tokio::test]
async fn close_flushes_queued_commands() {
    let (conn, mut nsqd) = pipe();
    conn.send(Command::Pub {
        topic: "t".into(),
        body: Bytes::from_static(b"last"),
    })
    .await
    .unwrap();
    conn.close();

    nsqd.expect_magic().await;
    assert_eq!(nsqd.read_line().await, "PUB t");
    assert_eq!(nsqd.read_body().await, b"last");
    // then EOF
    assert_eq!(nsqd.read_line().await, "");

    timeout(STEP, conn.wait_for_state(ConnectionState::Closed))
        .await
        .expect("state change")
        .expect("closed");
}

#[tokio::test]
async fn garbage_from_broker_fails_the_session() {
    let (conn, mut nsqd) = pipe();
    nsqd.expect_magic().await;
    nsqd.send_frame(7, b"?").await;
    timeout(Duration::from_secs(5), conn.wait_for_state(ConnectionState::Failed))
        .await
        .expect("state change")
        .expect("failed");
}

#[tokio::test]
async fn message_beyond_a_full_subscription_queue_is_requeued() {
    let (client_io, broker_io) = duplex(64 * 1024);
    let config = ClientConfig::default().queue_depth(1);
    let conn = Connection::from_transport(Endpoint::new("a", 4150), client_io, &config);
    let mut nsqd = FakeNsqd::new(broker_io);
    nsqd.expect_magic().await;

    let mut frames = conn.attach("t", "c").await.expect("attach");
    nsqd.message(common::id("m1"), 1, b"kept").await;
    nsqd.message(common::id("m2"), 1, b"overflow").await;

    assert_eq!(nsqd.read_line().await, format!("REQ {} 0", id_str("m2")));
    match timeout(STEP, frames.recv()).await.unwrap() {
        Some(Frame::Message(m)) => assert_eq!(m.body.as_ref(), b"kept"),
        other => panic!("expected m1, got {:?}", other),
    }
}

#[tokio::test]
async fn message_without_subscription_is_requeued() {
    let (_conn, mut nsqd) = pipe();
    nsqd.expect_magic().await;
    nsqd.message(common::id("m3"), 2, b"stray").await;
    assert_eq!(nsqd.read_line().await, format!("REQ {} 0", id_str("m3")));
}

#[tokio::test]
async fn write_returns_once_the_command_is_on_the_wire() {
    let (conn, mut nsqd) = pipe();
    conn.write(Command::Pub {
        topic: "t".into(),
        body: Bytes::from_static(b"sync"),
    })
    .await
    .expect("written");
    nsqd.expect_magic().await;
    assert_eq!(nsqd.read_line().await, "PUB t");
    assert_eq!(nsqd.read_body().await, b"sync");
}
