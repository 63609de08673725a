//! Links between federates and the coordinator.
//!
//! A link is a reliable, ordered, bidirectional frame channel. The write
//! half stays with its owner; the read half runs on a dedicated thread that
//! decodes frames and forwards them, tagged with the link id, into the
//! owner's inbound channel. Losing the connection shows up as
//! [`Inbound::Closed`].
//!
//! Two endpoint kinds ship with the crate: TCP streams for multi-process
//! federations and in-memory channel pairs for single-process ones.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::thread;

use tracing::{debug, trace};

use crate::error::{RuntimeError, RuntimeResult};
use crate::federated::message::{FrameHeader, Message, HEADER_LEN};

/// Write half of a link.
pub trait FrameWriter: Send {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Read half of a link. Returns `Ok(None)` once the peer has closed.
pub trait FrameReader: Send {
    fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Both halves of one side of a link.
pub struct Endpoint {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
}

impl Endpoint {
    pub fn new(writer: Box<dyn FrameWriter>, reader: Box<dyn FrameReader>) -> Self {
        Self { writer, reader }
    }

    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Ok(Self {
            writer: Box::new(TcpWriter { stream }),
            reader: Box::new(TcpReader { stream: reader }),
        })
    }

    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::tcp(TcpStream::connect(addr)?)
    }
}

/// Two connected in-memory endpoints.
pub fn memory_pair() -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    (
        Endpoint::new(
            Box::new(MemoryWriter { tx: a_tx }),
            Box::new(MemoryReader { rx: b_rx }),
        ),
        Endpoint::new(
            Box::new(MemoryWriter { tx: b_tx }),
            Box::new(MemoryReader { rx: a_rx }),
        ),
    )
}

struct TcpWriter {
    stream: TcpStream,
}

impl FrameWriter for TcpWriter {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame)?;
        self.stream.flush()
    }
}

struct TcpReader {
    stream: TcpStream,
}

impl FrameReader for TcpReader {
    fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut frame = vec![0u8; HEADER_LEN];
        match self.stream.read_exact(&mut frame) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        let header = FrameHeader::parse(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        frame.resize(HEADER_LEN + header.payload_len, 0);
        self.stream.read_exact(&mut frame[HEADER_LEN..])?;
        Ok(Some(frame))
    }
}

struct MemoryWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl FrameWriter for MemoryWriter {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
    }
}

struct MemoryReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl FrameReader for MemoryReader {
    fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().ok())
    }
}

/// What a link's reader thread delivers.
#[derive(Debug)]
pub enum Inbound {
    Message { link: usize, message: Message },
    Closed { link: usize, reason: String },
}

/// The owner's side of a link.
pub struct Link {
    id: usize,
    peer: String,
    writer: Box<dyn FrameWriter>,
}

impl Link {
    /// Starts the reader thread for `endpoint` and keeps its writer.
    pub fn open(
        id: usize,
        peer: impl Into<String>,
        endpoint: Endpoint,
        inbound: mpsc::Sender<Inbound>,
    ) -> io::Result<Self> {
        let peer = peer.into();
        let Endpoint { writer, mut reader } = endpoint;
        thread::Builder::new()
            .name(format!("kairos-link-{id}"))
            .spawn(move || loop {
                let closed = match reader.read_frame() {
                    Ok(Some(frame)) => match Message::decode(&frame) {
                        Ok(message) => {
                            trace!(link = id, kind = ?message.kind(), "frame received");
                            if inbound.send(Inbound::Message { link: id, message }).is_err() {
                                return;
                            }
                            continue;
                        }
                        Err(err) => format!("undecodable frame: {err}"),
                    },
                    Ok(None) => "connection closed".to_string(),
                    Err(err) => err.to_string(),
                };
                debug!(link = id, reason = %closed, "link reader stopped");
                let _ = inbound.send(Inbound::Closed {
                    link: id,
                    reason: closed,
                });
                return;
            })?;
        Ok(Self { id, peer, writer })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send(&mut self, message: &Message) -> RuntimeResult<()> {
        let frame = message.encode()?;
        self.writer
            .write_frame(&frame)
            .map_err(|err| RuntimeError::TransportFailure {
                peer: self.peer.clone(),
                reason: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::Tag;
    use std::net::TcpListener;
    use std::time::Duration;

    fn expect_message(rx: &mpsc::Receiver<Inbound>) -> Message {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Inbound::Message { message, .. } => message,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_memory_link_in_order() {
        let (a, b) = memory_pair();
        let (tx, rx) = mpsc::channel();
        let mut left = Link::open(0, "right", a, tx.clone()).unwrap();
        let _right = Link::open(1, "left", b, tx).unwrap();

        for i in 0..10 {
            left.send(&Message::Grant { tag: Tag::at(i) }).unwrap();
        }
        for i in 0..10 {
            assert_eq!(expect_message(&rx), Message::Grant { tag: Tag::at(i) });
        }
    }

    #[test]
    fn test_memory_link_reports_close() {
        let (a, b) = memory_pair();
        let (tx, rx) = mpsc::channel();
        let _link = Link::open(7, "peer", a, tx).unwrap();
        drop(b);
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Inbound::Closed { link, .. } => assert_eq!(link, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tcp_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || Endpoint::connect(addr).unwrap());
        let (stream, _) = listener.accept().unwrap();
        let server = Endpoint::tcp(stream).unwrap();
        let client = client.join().unwrap();

        let (tx, rx) = mpsc::channel();
        let mut a = Link::open(0, "server", client, tx.clone()).unwrap();
        let _b = Link::open(1, "client", server, tx).unwrap();
        let msg = Message::Failed {
            federate: 4,
            reason: "reaction fault".into(),
        };
        a.send(&msg).unwrap();
        assert_eq!(expect_message(&rx), msg);
    }
}
