use std::collections::VecDeque;
use std::io::Cursor;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{sleep, Duration};

use redmux::commands::Command;
use redmux::frame::Frame;
use redmux::sentinel::Config;
use redmux::{Connection, ConnectionState, Error};

enum ServerOp {
    /// Queue a reply; it is written as soon as a command is owed one.
    Reply(Vec<u8>),
    /// Write raw bytes immediately, regardless of what was received.
    Raw(Vec<u8>),
    /// Drop the client socket.
    Close,
}

/// A scripted server: it parses inbound command frames and answers each one
/// with the next queued reply, which keeps reply order honest no matter how
/// the client batches its writes.
async fn scripted_server() -> (String, UnboundedSender<ServerOp>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerOp>();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (mut read_half, mut write_half) = socket.into_split();

        // Outbound bytes funnel through one channel; dropping it closes the
        // socket's write side.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let mut buffer = BytesMut::with_capacity(4096);
        let mut replies: VecDeque<Vec<u8>> = VecDeque::new();
        // Commands received that are still waiting for a scripted reply.
        let mut owed: usize = 0;

        loop {
            tokio::select! {
                op = rx.recv() => match op {
                    Some(ServerOp::Reply(bytes)) => {
                        if owed > 0 {
                            owed -= 1;
                            let _ = out_tx.send(bytes);
                        } else {
                            replies.push_back(bytes);
                        }
                    }
                    Some(ServerOp::Raw(bytes)) => {
                        let _ = out_tx.send(bytes);
                    }
                    Some(ServerOp::Close) | None => break,
                },
                read = read_half.read_buf(&mut buffer) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    loop {
                        let mut cursor = Cursor::new(&buffer[..]);
                        match Frame::parse(&mut cursor) {
                            Ok(_) => {
                                let consumed = cursor.position() as usize;
                                buffer.advance(consumed);
                                match replies.pop_front() {
                                    Some(bytes) => {
                                        let _ = out_tx.send(bytes);
                                    }
                                    None => owed += 1,
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        }
    });

    (address, tx)
}

fn simple(s: &str) -> Vec<u8> {
    Frame::Simple(s.to_string()).serialize()
}

fn bulk(s: &str) -> Vec<u8> {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes())).serialize()
}

fn info_reply() -> Vec<u8> {
    bulk("redis_version:7.2.4\r\nrole:master\r\n")
}

async fn open_connection(address: &str, options: &str) -> Connection {
    let config = Config::parse(&format!("{address}{options}")).unwrap();
    Connection::open(address, config).await.unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn replies_are_delivered_in_send_order() {
    let (address, server) = scripted_server().await;
    server.send(ServerOp::Reply(info_reply())).unwrap();
    let connection = open_connection(&address, "").await;

    for i in 0..5 {
        let reply = bulk(&format!("value-{i}"));
        server.send(ServerOp::Reply(reply)).unwrap();
    }

    // All five go out pipelined before any reply is awaited.
    let handles: Vec<_> = (0..5)
        .map(|i| {
            connection
                .raw(None, Command::new("ECHO").arg(i.to_string()))
                .unwrap()
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let expected = Frame::Bulk(Bytes::from(format!("value-{i}")));
        assert_eq!(handle.wait().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn partial_frames_are_reassembled_across_reads() {
    let (address, server) = scripted_server().await;
    server.send(ServerOp::Reply(info_reply())).unwrap();
    let connection = open_connection(&address, "").await;

    let handle = connection
        .raw(None, Command::new("GET").arg("mykey"))
        .unwrap();

    // Reply split into three writes to simulate partial delivery.
    for part in [&b"$7\r\nmy"[..], &b"val"[..], &b"ue\r\n"[..]] {
        server.send(ServerOp::Raw(part.to_vec())).unwrap();
        sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        handle.wait().await.unwrap(),
        Frame::Bulk(Bytes::from("myvalue"))
    );
}

#[tokio::test]
async fn counters_are_consistent_once_work_drains() {
    let (address, server) = scripted_server().await;
    server.send(ServerOp::Reply(info_reply())).unwrap();
    let connection = open_connection(&address, "").await;

    server.send(ServerOp::Reply(simple("OK"))).unwrap();
    server.send(ServerOp::Reply(simple("OK"))).unwrap();
    server
        .send(ServerOp::Reply(Frame::Error("ERR boom".to_string()).serialize()))
        .unwrap();

    for _ in 0..2 {
        connection
            .raw(None, Command::new("SET").arg("k").arg("v"))
            .unwrap()
            .wait()
            .await
            .unwrap();
    }
    let failure = connection
        .raw(None, Command::new("SET").arg("k").arg("v"))
        .unwrap()
        .wait()
        .await;
    assert_eq!(failure, Err(Error::Server("ERR boom".to_string())));

    let counters = connection.counters();
    // INFO handshake plus the three SETs.
    assert_eq!(counters.sent, 4);
    assert_eq!(counters.received, 3);
    assert_eq!(counters.errors, 1);
    assert_eq!(
        counters.sent,
        counters.received + counters.errors + counters.cancelled + counters.timeouts
    );
    assert_eq!(counters.outstanding(), 0);
    assert_eq!(counters.sent_queue, 0);
    assert_eq!(counters.unsent_queue, 0);
}

#[tokio::test]
async fn server_error_replies_do_not_affect_sibling_requests() {
    let (address, server) = scripted_server().await;
    server.send(ServerOp::Reply(info_reply())).unwrap();
    let connection = open_connection(&address, "").await;

    server
        .send(ServerOp::Reply(Frame::Error("ERR first".to_string()).serialize()))
        .unwrap();
    server.send(ServerOp::Reply(bulk("second"))).unwrap();

    let first = connection.raw(None, Command::new("GET").arg("a")).unwrap();
    let second = connection.raw(None, Command::new("GET").arg("b")).unwrap();

    assert_eq!(first.wait().await, Err(Error::Server("ERR first".to_string())));
    assert_eq!(
        second.wait().await.unwrap(),
        Frame::Bulk(Bytes::from("second"))
    );
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test]
async fn disconnect_cancels_every_pending_handle_exactly_once() {
    let (address, server) = scripted_server().await;
    server.send(ServerOp::Reply(info_reply())).unwrap();
    let connection = open_connection(&address, "").await;

    let first = connection.raw(None, Command::new("GET").arg("a")).unwrap();
    let second = connection.raw(None, Command::new("GET").arg("b")).unwrap();

    // Give the writer a moment to flush, then kill the transport.
    sleep(Duration::from_millis(50)).await;
    server.send(ServerOp::Close).unwrap();

    let fault = Error::Transport("connection closed by server".to_string());
    assert_eq!(first.wait().await, Err(fault.clone()));
    assert_eq!(second.wait().await, Err(fault));

    assert_eq!(connection.state(), ConnectionState::Faulted);
    let counters = connection.counters();
    assert_eq!(counters.cancelled, 2);
    assert_eq!(counters.sent_queue, 0);
    assert_eq!(counters.unsent_queue, 0);

    // A faulted connection admits nothing.
    let rejected = connection.raw(None, Command::new("PING"));
    assert!(matches!(
        rejected.err(),
        Some(Error::SubmissionRejected(ConnectionState::Faulted))
    ));
}

#[tokio::test]
async fn unsolicited_reply_desynchronizes_and_faults() {
    let (address, server) = scripted_server().await;
    server.send(ServerOp::Reply(info_reply())).unwrap();
    let connection = open_connection(&address, "").await;

    // Nothing is outstanding; this reply matches no request.
    server
        .send(ServerOp::Raw(b"+UNEXPECTED\r\n".to_vec()))
        .unwrap();

    wait_until(|| connection.state() == ConnectionState::Faulted).await;
}

#[tokio::test]
async fn timed_out_request_fails_locally_and_absorbs_its_late_reply() {
    let (address, server) = scripted_server().await;
    server.send(ServerOp::Reply(info_reply())).unwrap();
    let connection = open_connection(&address, ",timeout=100").await;

    // No reply scripted: the deadline fires first.
    let handle = connection
        .raw(None, Command::new("GET").arg("slow"))
        .unwrap();
    assert_eq!(handle.wait().await, Err(Error::Timeout));

    let counters = connection.counters();
    assert_eq!(counters.timeouts, 1);
    // The request stays queued so its eventual reply is absorbed in order.
    assert_eq!(counters.sent_queue, 1);

    server.send(ServerOp::Reply(bulk("late"))).unwrap();
    wait_until(|| connection.counters().sent_queue == 0).await;

    // The connection stays usable and the late reply was not misrouted.
    server.send(ServerOp::Reply(simple("PONG"))).unwrap();
    connection.ping().await.unwrap();

    let counters = connection.counters();
    assert_eq!(counters.received, 2); // INFO + PING
    assert_eq!(counters.timeouts, 1);
    assert_eq!(
        counters.sent,
        counters.received + counters.errors + counters.cancelled + counters.timeouts
    );
    assert!(counters.last_ping_ms.is_some());
}

#[tokio::test]
async fn close_is_graceful_and_idempotent() {
    let (address, server) = scripted_server().await;
    server.send(ServerOp::Reply(info_reply())).unwrap();
    let connection = open_connection(&address, "").await;

    server.send(ServerOp::Reply(simple("PONG"))).unwrap();
    connection.ping().await.unwrap();

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Closed);

    let rejected = connection.raw(None, Command::new("PING"));
    assert!(matches!(
        rejected.err(),
        Some(Error::SubmissionRejected(ConnectionState::Closed))
    ));

    // Closing again is a no-op.
    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
}
