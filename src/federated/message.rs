//! Wire format of the federation protocol.
//!
//! Every frame is a fixed 24-byte little-endian header followed by a
//! payload:
//!
//! ```text
//! offset  size  field
//!      0     1  kind
//!      1     1  reserved (zero)
//!      2     2  federate id
//!      4     8  tag time (ns)
//!     12     4  tag microstep
//!     16     4  reserved (zero)
//!     20     4  payload length
//! ```
//!
//! Tagged messages and port-absent notices carry the connection index as a
//! `u32` at the start of the payload; tagged messages follow it with the
//! JSON-encoded value. The neighbor table is JSON; failure and abort reasons
//! are UTF-8 text.

use serde_json::Value;
use thiserror::Error;

use crate::federated::topology::ConnectionEntry;
use crate::tag::Tag;
use crate::types::FederateId;

pub const HEADER_LEN: usize = 24;

/// Largest accepted payload.
pub const MAX_PAYLOAD: usize = 8_000_000;

/// Framing and decoding failures.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("payload JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload text: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type WireResult<T> = Result<T, WireError>;

/// Message kind byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 1,
    Neighbors = 2,
    Start = 3,
    TaggedMessage = 4,
    NextEventTag = 5,
    LogicalTagComplete = 6,
    Grant = 7,
    ProvisionalGrant = 8,
    Ack = 9,
    PortAbsent = 10,
    StopRequest = 11,
    StopReply = 12,
    Stop = 13,
    Resign = 14,
    Failed = 15,
    Abort = 16,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(byte: u8) -> WireResult<Self> {
        use MessageKind::*;
        Ok(match byte {
            1 => Hello,
            2 => Neighbors,
            3 => Start,
            4 => TaggedMessage,
            5 => NextEventTag,
            6 => LogicalTagComplete,
            7 => Grant,
            8 => ProvisionalGrant,
            9 => Ack,
            10 => PortAbsent,
            11 => StopRequest,
            12 => StopReply,
            13 => Stop,
            14 => Resign,
            15 => Failed,
            16 => Abort,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

/// One protocol message.
///
/// `federate` is the sender for messages from a federate. For messages from
/// the coordinator it names the federate the message is about (the source of
/// a routed message, the upstream of an ack).
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Federate joins.
    Hello { federate: FederateId },
    /// Connections touching the receiving federate.
    Neighbors {
        federate: FederateId,
        connections: Vec<ConnectionEntry>,
    },
    /// Wall-clock nanoseconds of logical time zero.
    Start { start_epoch: i64 },
    /// A value for connection `connection` at its arrival tag.
    Tagged {
        federate: FederateId,
        tag: Tag,
        connection: u32,
        value: Value,
    },
    NextEventTag { federate: FederateId, tag: Tag },
    LogicalTagComplete { federate: FederateId, tag: Tag },
    Grant { tag: Tag },
    ProvisionalGrant { tag: Tag },
    /// `upstream` completed `tag`.
    Ack { upstream: FederateId, tag: Tag },
    /// Connection `connection` carries nothing at `tag`.
    PortAbsent {
        federate: FederateId,
        tag: Tag,
        connection: u32,
    },
    StopRequest { federate: FederateId, tag: Tag },
    StopReply { federate: FederateId, tag: Tag },
    Stop { tag: Tag },
    Resign { federate: FederateId },
    Failed { federate: FederateId, reason: String },
    Abort { origin: FederateId, reason: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Neighbors { .. } => MessageKind::Neighbors,
            Message::Start { .. } => MessageKind::Start,
            Message::Tagged { .. } => MessageKind::TaggedMessage,
            Message::NextEventTag { .. } => MessageKind::NextEventTag,
            Message::LogicalTagComplete { .. } => MessageKind::LogicalTagComplete,
            Message::Grant { .. } => MessageKind::Grant,
            Message::ProvisionalGrant { .. } => MessageKind::ProvisionalGrant,
            Message::Ack { .. } => MessageKind::Ack,
            Message::PortAbsent { .. } => MessageKind::PortAbsent,
            Message::StopRequest { .. } => MessageKind::StopRequest,
            Message::StopReply { .. } => MessageKind::StopReply,
            Message::Stop { .. } => MessageKind::Stop,
            Message::Resign { .. } => MessageKind::Resign,
            Message::Failed { .. } => MessageKind::Failed,
            Message::Abort { .. } => MessageKind::Abort,
        }
    }

    /// Encodes the message into one frame.
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let (federate, tag, payload) = match self {
            Message::Hello { federate } | Message::Resign { federate } => {
                (*federate, Tag::ZERO, Vec::new())
            }
            Message::Neighbors {
                federate,
                connections,
            } => (*federate, Tag::ZERO, serde_json::to_vec(connections)?),
            Message::Start { start_epoch } => (0, Tag::at(*start_epoch), Vec::new()),
            Message::Tagged {
                federate,
                tag,
                connection,
                value,
            } => {
                let mut payload = connection.to_le_bytes().to_vec();
                serde_json::to_writer(&mut payload, value)?;
                (*federate, *tag, payload)
            }
            Message::NextEventTag { federate, tag }
            | Message::LogicalTagComplete { federate, tag }
            | Message::StopRequest { federate, tag }
            | Message::StopReply { federate, tag } => (*federate, *tag, Vec::new()),
            Message::Grant { tag } | Message::ProvisionalGrant { tag } | Message::Stop { tag } => {
                (0, *tag, Vec::new())
            }
            Message::Ack { upstream, tag } => (*upstream, *tag, Vec::new()),
            Message::PortAbsent {
                federate,
                tag,
                connection,
            } => (*federate, *tag, connection.to_le_bytes().to_vec()),
            Message::Failed { federate, reason } => {
                (*federate, Tag::ZERO, reason.as_bytes().to_vec())
            }
            Message::Abort { origin, reason } => (*origin, Tag::ZERO, reason.as_bytes().to_vec()),
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(self.kind() as u8);
        frame.push(0);
        frame.extend_from_slice(&federate.to_le_bytes());
        frame.extend_from_slice(&tag.time.to_le_bytes());
        frame.extend_from_slice(&tag.microstep.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes one complete frame.
    pub fn decode(frame: &[u8]) -> WireResult<Message> {
        let header = FrameHeader::parse(frame)?;
        let needed = HEADER_LEN + header.payload_len;
        if frame.len() < needed {
            return Err(WireError::Truncated {
                needed,
                available: frame.len(),
            });
        }
        let payload = &frame[HEADER_LEN..needed];
        let federate = header.federate;
        let tag = header.tag;

        Ok(match header.kind {
            MessageKind::Hello => Message::Hello { federate },
            MessageKind::Neighbors => Message::Neighbors {
                federate,
                connections: serde_json::from_slice(payload)?,
            },
            MessageKind::Start => Message::Start {
                start_epoch: tag.time,
            },
            MessageKind::TaggedMessage => {
                let connection = read_u32(payload)?;
                Message::Tagged {
                    federate,
                    tag,
                    connection,
                    value: serde_json::from_slice(&payload[4..])?,
                }
            }
            MessageKind::NextEventTag => Message::NextEventTag { federate, tag },
            MessageKind::LogicalTagComplete => Message::LogicalTagComplete { federate, tag },
            MessageKind::Grant => Message::Grant { tag },
            MessageKind::ProvisionalGrant => Message::ProvisionalGrant { tag },
            MessageKind::Ack => Message::Ack {
                upstream: federate,
                tag,
            },
            MessageKind::PortAbsent => Message::PortAbsent {
                federate,
                tag,
                connection: read_u32(payload)?,
            },
            MessageKind::StopRequest => Message::StopRequest { federate, tag },
            MessageKind::StopReply => Message::StopReply { federate, tag },
            MessageKind::Stop => Message::Stop { tag },
            MessageKind::Resign => Message::Resign { federate },
            MessageKind::Failed => Message::Failed {
                federate,
                reason: String::from_utf8(payload.to_vec())?,
            },
            MessageKind::Abort => Message::Abort {
                origin: federate,
                reason: String::from_utf8(payload.to_vec())?,
            },
        })
    }
}

/// Decoded fixed header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    pub federate: FederateId,
    pub tag: Tag,
    pub payload_len: usize,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        let kind = MessageKind::try_from(bytes[0])?;
        let federate = u16::from_le_bytes([bytes[2], bytes[3]]);
        let mut time = [0u8; 8];
        time.copy_from_slice(&bytes[4..12]);
        let microstep = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let payload_len = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            kind,
            federate,
            tag: Tag::new(i64::from_le_bytes(time), microstep),
            payload_len,
        })
    }
}

fn read_u32(payload: &[u8]) -> WireResult<u32> {
    if payload.len() < 4 {
        return Err(WireError::Truncated {
            needed: HEADER_LEN + 4,
            available: HEADER_LEN + payload.len(),
        });
    }
    Ok(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::msec;
    use serde_json::json;

    #[test]
    fn test_header_layout() {
        let frame = Message::NextEventTag {
            federate: 0x0102,
            tag: Tag::new(msec(10), 3),
        }
        .encode()
        .unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(frame[0], MessageKind::NextEventTag as u8);
        assert_eq!(frame[1], 0);
        assert_eq!(&frame[2..4], &[0x02, 0x01]);
        assert_eq!(&frame[4..12], &msec(10).to_le_bytes());
        assert_eq!(&frame[12..16], &3u32.to_le_bytes());
        assert_eq!(&frame[20..24], &0u32.to_le_bytes());
    }

    #[test]
    fn test_tagged_payload() {
        let msg = Message::Tagged {
            federate: 1,
            tag: Tag::at(msec(10)),
            connection: 7,
            value: json!({"x": 5}),
        };
        let frame = msg.encode().unwrap();
        assert_eq!(&frame[HEADER_LEN..HEADER_LEN + 4], &7u32.to_le_bytes());
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_neighbors_and_text_payloads() {
        let neighbors = Message::Neighbors {
            federate: 2,
            connections: vec![ConnectionEntry {
                index: 0,
                src: 1,
                src_port: "a.out".into(),
                src_channel: 0,
                dst: 2,
                dst_port: "b.in".into(),
                dst_channel: 0,
                delay: Some(msec(10)),
            }],
        };
        assert_eq!(Message::decode(&neighbors.encode().unwrap()).unwrap(), neighbors);

        let abort = Message::Abort {
            origin: 3,
            reason: "link lost".into(),
        };
        assert_eq!(Message::decode(&abort.encode().unwrap()).unwrap(), abort);
    }

    #[test]
    fn test_start_carries_epoch_in_time_field() {
        let msg = Message::Start {
            start_epoch: 1_700_000_000_000_000_000,
        };
        let frame = msg.encode().unwrap();
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.tag.time, 1_700_000_000_000_000_000);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(matches!(
            Message::decode(&[1, 0, 0]),
            Err(WireError::Truncated { needed: 24, available: 3 })
        ));

        let mut frame = Message::Resign { federate: 1 }.encode().unwrap();
        frame[0] = 99;
        assert!(matches!(Message::decode(&frame), Err(WireError::UnknownKind(99))));

        let mut frame = Message::Resign { federate: 1 }.encode().unwrap();
        frame[20..24].copy_from_slice(&(MAX_PAYLOAD as u32 + 1).to_le_bytes());
        assert!(matches!(
            Message::decode(&frame),
            Err(WireError::PayloadTooLarge(_))
        ));

        let mut frame = Message::PortAbsent {
            federate: 1,
            tag: Tag::ZERO,
            connection: 2,
        }
        .encode()
        .unwrap();
        frame.truncate(HEADER_LEN + 2);
        assert!(matches!(Message::decode(&frame), Err(WireError::Truncated { .. })));
    }
}
