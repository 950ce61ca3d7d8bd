// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TINC wire protocol.
//!
//! A frame is an 8-byte little-endian length followed by one envelope.
//! The envelope carries a 16-bit message type, a 16-bit object type
//! and a JSON `details` payload whose schema is fixed by the
//! `(message_type, object_type)` pair.
//!
//! ```text
//! +------------------+---------+---------+------------------+
//! | Length (8B LE)   | MT (2B) | OT (2B) | details (JSON)   |
//! +------------------+---------+---------+------------------+
//! ```

pub mod framing;
pub mod wire;

use crate::error::TincError;
use byteorder::{ByteOrder, LittleEndian};
use wire::*;

/// Per-connection outbound envelope channel. A dedicated writer task
/// drains it, so senders never block on socket backpressure.
pub type Outbound = tokio::sync::mpsc::UnboundedSender<Envelope>;

/// Protocol version. A mismatch aborts the connection.
pub const PROTOCOL_VERSION: u16 = 1;

/// Protocol revision. A mismatch only logs a warning.
pub const PROTOCOL_REVISION: u16 = 4;

/// Default TCP server port.
pub const DEFAULT_PORT: u16 = 34450;

/// Message type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request = 1,
    Remove = 2,
    Register = 3,
    Configure = 4,
    Command = 5,
    CommandReply = 6,
    Ping = 7,
    Pong = 8,
    Goodbye = 9,
    BarrierRequest = 10,
    BarrierAckLock = 11,
    BarrierUnlock = 12,
    Status = 13,
    WorkingPath = 14,
    ClientMetadata = 15,
}

impl MessageType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::Request,
            2 => Self::Remove,
            3 => Self::Register,
            4 => Self::Configure,
            5 => Self::Command,
            6 => Self::CommandReply,
            7 => Self::Ping,
            8 => Self::Pong,
            9 => Self::Goodbye,
            10 => Self::BarrierRequest,
            11 => Self::BarrierAckLock,
            12 => Self::BarrierUnlock,
            13 => Self::Status,
            14 => Self::WorkingPath,
            15 => Self::ClientMetadata,
            _ => return None,
        })
    }
}

/// Object type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Parameter = 1,
    ParameterSpace = 2,
    Processor = 3,
    DiskBuffer = 4,
    DataPool = 5,
    Global = 6,
}

impl ObjectType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::Parameter,
            2 => Self::ParameterSpace,
            3 => Self::Processor,
            4 => Self::DiskBuffer,
            5 => Self::DataPool,
            6 => Self::Global,
            _ => return None,
        })
    }

    /// The object classes a client asks for during synchronization.
    pub const SYNCHRONIZABLE: [ObjectType; 5] = [
        ObjectType::Parameter,
        ObjectType::ParameterSpace,
        ObjectType::Processor,
        ObjectType::DiskBuffer,
        ObjectType::DataPool,
    ];
}

/// Typed envelope payload. The concrete variant is fixed by the
/// `(message_type, object_type)` pair at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum Details {
    /// PING, PONG, GOODBYE.
    Empty,
    /// REQUEST and REMOVE carry a target id (empty = all).
    ObjectId(ObjectId),
    Register(RegisterObject),
    Configure(ConfigureObject),
    Command(CommandMessage),
    CommandReply(CommandReplyMessage),
    /// BARRIER_REQUEST, BARRIER_ACK_LOCK, BARRIER_UNLOCK.
    Barrier(BarrierNonce),
    Status(StatusMessage),
    WorkingPath(TincPath),
    ClientMetadata(ClientMetaData),
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_type: MessageType,
    pub object_type: ObjectType,
    pub details: Details,
}

impl Envelope {
    pub fn new(message_type: MessageType, object_type: ObjectType, details: Details) -> Self {
        Self {
            message_type,
            object_type,
            details,
        }
    }

    /// Shorthand for the detail-less GLOBAL messages.
    pub fn global(message_type: MessageType) -> Self {
        Self::new(message_type, ObjectType::Global, Details::Empty)
    }

    /// Encode into envelope bytes (no frame length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, TincError> {
        let details = match &self.details {
            Details::Empty => Vec::new(),
            Details::ObjectId(d) => serde_json::to_vec(d)?,
            Details::Register(d) => serde_json::to_vec(d)?,
            Details::Configure(d) => serde_json::to_vec(d)?,
            Details::Command(d) => serde_json::to_vec(d)?,
            Details::CommandReply(d) => serde_json::to_vec(d)?,
            Details::Barrier(d) => serde_json::to_vec(d)?,
            Details::Status(d) => serde_json::to_vec(d)?,
            Details::WorkingPath(d) => serde_json::to_vec(d)?,
            Details::ClientMetadata(d) => serde_json::to_vec(d)?,
        };

        let mut buf = vec![0u8; 4 + details.len()];
        LittleEndian::write_u16(&mut buf[0..2], self.message_type.as_u16());
        LittleEndian::write_u16(&mut buf[2..4], self.object_type.as_u16());
        buf[4..].copy_from_slice(&details);
        Ok(buf)
    }

    /// Decode envelope bytes. The payload schema is chosen from the
    /// `(message_type, object_type)` pair; a payload that does not
    /// fit the pair is an [`TincError::UnexpectedPayload`].
    pub fn decode(bytes: &[u8]) -> Result<Self, TincError> {
        if bytes.len() < 4 {
            return Err(TincError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "envelope shorter than header",
            )));
        }
        let mt_raw = LittleEndian::read_u16(&bytes[0..2]);
        let ot_raw = LittleEndian::read_u16(&bytes[2..4]);
        let message_type = MessageType::from_u16(mt_raw).ok_or_else(|| {
            TincError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown message type {}", mt_raw),
            ))
        })?;
        let object_type = ObjectType::from_u16(ot_raw).ok_or_else(|| {
            TincError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown object type {}", ot_raw),
            ))
        })?;

        let body = &bytes[4..];
        let unexpected = || TincError::UnexpectedPayload {
            message_type,
            object_type,
        };

        let details = match message_type {
            MessageType::Ping | MessageType::Pong | MessageType::Goodbye => Details::Empty,
            MessageType::Request | MessageType::Remove => {
                Details::ObjectId(serde_json::from_slice(body).map_err(|_| unexpected())?)
            }
            MessageType::Register => {
                let reg: RegisterObject =
                    serde_json::from_slice(body).map_err(|_| unexpected())?;
                if reg.object_type() != object_type {
                    return Err(unexpected());
                }
                Details::Register(reg)
            }
            MessageType::Configure => {
                let cfg: ConfigureObject =
                    serde_json::from_slice(body).map_err(|_| unexpected())?;
                if cfg.object_type() != object_type {
                    return Err(unexpected());
                }
                Details::Configure(cfg)
            }
            MessageType::Command => {
                Details::Command(serde_json::from_slice(body).map_err(|_| unexpected())?)
            }
            MessageType::CommandReply => {
                Details::CommandReply(serde_json::from_slice(body).map_err(|_| unexpected())?)
            }
            MessageType::BarrierRequest
            | MessageType::BarrierAckLock
            | MessageType::BarrierUnlock => {
                Details::Barrier(serde_json::from_slice(body).map_err(|_| unexpected())?)
            }
            MessageType::Status => {
                Details::Status(serde_json::from_slice(body).map_err(|_| unexpected())?)
            }
            MessageType::WorkingPath => {
                Details::WorkingPath(serde_json::from_slice(body).map_err(|_| unexpected())?)
            }
            MessageType::ClientMetadata => {
                Details::ClientMetadata(serde_json::from_slice(body).map_err(|_| unexpected())?)
            }
        };

        Ok(Self {
            message_type,
            object_type,
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for raw in 1..=15u16 {
            let mt = MessageType::from_u16(raw).unwrap();
            assert_eq!(mt.as_u16(), raw);
        }
        assert!(MessageType::from_u16(0).is_none());
        assert!(MessageType::from_u16(16).is_none());
    }

    #[test]
    fn test_object_type_roundtrip() {
        for raw in 1..=6u16 {
            let ot = ObjectType::from_u16(raw).unwrap();
            assert_eq!(ot.as_u16(), raw);
        }
        assert!(ObjectType::from_u16(7).is_none());
    }

    #[test]
    fn test_envelope_roundtrip_ping() {
        let env = Envelope::global(MessageType::Ping);
        let bytes = env.encode().unwrap();
        assert_eq!(bytes.len(), 4); // header only
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_envelope_roundtrip_request() {
        let env = Envelope::new(
            MessageType::Request,
            ObjectType::Parameter,
            Details::ObjectId(ObjectId { id: String::new() }),
        );
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_envelope_roundtrip_barrier() {
        let env = Envelope::new(
            MessageType::BarrierRequest,
            ObjectType::Global,
            Details::Barrier(BarrierNonce { request_id: 7 }),
        );
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        match back.details {
            Details::Barrier(nonce) => assert_eq!(nonce.request_id, 7),
            other => panic!("wrong details: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_mismatched_register_object() {
        // RegisterObject says DiskBuffer but the header says Parameter.
        let reg = RegisterObject::DiskBuffer(RegisterDiskBuffer {
            id: "buf".into(),
            buffer_type: BufferType::Json,
            base_filename: "out.json".into(),
            path: String::new(),
        });
        let env = Envelope::new(
            MessageType::Register,
            ObjectType::DiskBuffer,
            Details::Register(reg),
        );
        let mut bytes = env.encode().unwrap();
        LittleEndian::write_u16(&mut bytes[2..4], ObjectType::Parameter.as_u16());

        match Envelope::decode(&bytes) {
            Err(TincError::UnexpectedPayload { .. }) => {}
            other => panic!("expected UnexpectedPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_message_type() {
        let mut bytes = vec![0u8; 4];
        LittleEndian::write_u16(&mut bytes[0..2], 999);
        LittleEndian::write_u16(&mut bytes[2..4], 6);
        assert!(Envelope::decode(&bytes).is_err());
    }
}
