//! Framing over real sockets.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use kairos::federated::message::{Message, HEADER_LEN};
use kairos::federated::transport::{Endpoint, Inbound, Link};
use kairos::Tag;
use serde_json::json;

/// A connected raw stream and a link reading from the other end.
fn raw_to_link() -> (TcpStream, Link, mpsc::Receiver<Inbound>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let raw = thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (stream, _) = listener.accept().unwrap();
    let (tx, rx) = mpsc::channel();
    let link = Link::open(3, "raw", Endpoint::tcp(stream).unwrap(), tx).unwrap();
    (raw.join().unwrap(), link, rx)
}

fn next(rx: &mpsc::Receiver<Inbound>) -> Inbound {
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn test_frames_split_across_writes() {
    let (mut raw, _link, rx) = raw_to_link();
    let msg = Message::Tagged {
        federate: 4,
        tag: Tag::new(1_000, 2),
        connection: 1,
        value: json!({"reading": [1.5, 2.5], "unit": "m"}),
    };
    let frame = msg.encode().unwrap();

    // header in two pieces, then the payload byte by byte
    raw.write_all(&frame[..10]).unwrap();
    raw.flush().unwrap();
    thread::sleep(Duration::from_millis(5));
    raw.write_all(&frame[10..HEADER_LEN]).unwrap();
    for byte in &frame[HEADER_LEN..] {
        raw.write_all(&[*byte]).unwrap();
    }
    raw.flush().unwrap();

    match next(&rx) {
        Inbound::Message { link, message } => {
            assert_eq!(link, 3);
            assert_eq!(message, msg);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_back_to_back_frames() {
    let (mut raw, _link, rx) = raw_to_link();
    let messages = vec![
        Message::NextEventTag {
            federate: 1,
            tag: Tag::FOREVER,
        },
        Message::LogicalTagComplete {
            federate: 1,
            tag: Tag::NEVER,
        },
        Message::Failed {
            federate: 1,
            reason: "düsseldorf sensor".into(),
        },
    ];
    let mut bytes = Vec::new();
    for msg in &messages {
        bytes.extend(msg.encode().unwrap());
    }
    raw.write_all(&bytes).unwrap();

    for expected in messages {
        match next(&rx) {
            Inbound::Message { message, .. } => assert_eq!(message, expected),
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn test_garbage_closes_link() {
    let (mut raw, _link, rx) = raw_to_link();
    let mut frame = Message::Resign { federate: 1 }.encode().unwrap();
    frame[0] = 200;
    raw.write_all(&frame).unwrap();
    match next(&rx) {
        Inbound::Closed { link, reason } => {
            assert_eq!(link, 3);
            assert!(reason.contains("200"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_peer_close_is_reported() {
    let (raw, _link, rx) = raw_to_link();
    drop(raw);
    assert!(matches!(next(&rx), Inbound::Closed { link: 3, .. }));
}
