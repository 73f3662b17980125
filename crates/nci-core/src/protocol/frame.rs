//! NCI frame parsing and construction.
//!
//! Every packet on the link starts with a 3-byte header: byte 0 carries
//! the message type (top three bits), the packet boundary flag and the
//! group (or connection) id, byte 1 the opcode, byte 2 the payload length.

use std::fmt;

use byteorder::{BigEndian, WriteBytesExt};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {actual} bytes, header needs 3")]
    TooShort { actual: usize },
    #[error("Length mismatch: header says {declared} payload bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Unknown message type bits 0x{0:02X}")]
    UnknownMessageType(u8),
    #[error("Payload of {0} bytes does not fit a single packet")]
    PayloadTooLarge(usize),
}

/// NCI message type, from the top three bits of byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Data,
    Command,
    Response,
    Notification,
}

impl MessageType {
    /// Classify a raw first header byte.
    pub fn from_header_byte(byte: u8) -> Result<Self, FrameError> {
        match byte & MT_MASK {
            MT_DATA => Ok(MessageType::Data),
            MT_CMD => Ok(MessageType::Command),
            MT_RSP => Ok(MessageType::Response),
            MT_NTF => Ok(MessageType::Notification),
            other => Err(FrameError::UnknownMessageType(other >> MT_SHIFT)),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            MessageType::Data => MT_DATA,
            MessageType::Command => MT_CMD,
            MessageType::Response => MT_RSP,
            MessageType::Notification => MT_NTF,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Data => write!(f, "DATA"),
            MessageType::Command => write!(f, "CMD"),
            MessageType::Response => write!(f, "RSP"),
            MessageType::Notification => write!(f, "NTF"),
        }
    }
}

/// Message type of a raw buffer, if it has at least one byte.
pub fn message_type_of(bytes: &[u8]) -> Option<MessageType> {
    bytes
        .first()
        .and_then(|&b| MessageType::from_header_byte(b).ok())
}

/// True for anything but a data packet (MT bits non-zero).
///
/// Control packets are the ones the controller acknowledges, so these are
/// the frames the retransmission timer guards.
pub fn is_control_packet(bytes: &[u8]) -> bool {
    bytes.first().is_some_and(|&b| (b >> MT_SHIFT) & 0x07 != 0)
}

/// True when the buffer starts with a command header (`0x2?`).
pub fn is_command(bytes: &[u8]) -> bool {
    bytes.first().is_some_and(|&b| b & 0xF0 == MT_CMD)
}

/// Decoded 3-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NciHeader {
    pub message_type: MessageType,
    pub segmented: bool,
    /// GID for control packets, connection id for data packets.
    pub gid: u8,
    /// OID for control packets, reserved/credits byte for data packets.
    pub oid: u8,
    pub payload_len: usize,
}

impl NciHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < NCI_HEADER_SIZE {
            return Err(FrameError::TooShort {
                actual: bytes.len(),
            });
        }
        let message_type = MessageType::from_header_byte(bytes[0])?;
        let oid = if message_type == MessageType::Data {
            bytes[1]
        } else {
            bytes[1] & OID_MASK
        };
        Ok(Self {
            message_type,
            segmented: bytes[0] & PBF_MASK != 0,
            gid: bytes[0] & GID_MASK,
            oid,
            payload_len: bytes[NCI_LEN_OFFSET] as usize,
        })
    }
}

/// A complete, length-checked NCI packet.
#[derive(Clone, PartialEq, Eq)]
pub struct NciFrame {
    header: NciHeader,
    bytes: Vec<u8>,
}

impl NciFrame {
    /// Parse and validate a packet. Trailing bytes beyond the declared
    /// payload are rejected as a length mismatch.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, FrameError> {
        let header = NciHeader::parse(&bytes)?;
        let actual = bytes.len() - NCI_HEADER_SIZE;
        if actual != header.payload_len {
            return Err(FrameError::LengthMismatch {
                declared: header.payload_len,
                actual,
            });
        }
        Ok(Self { header, bytes })
    }

    /// Build a control packet from its parts.
    pub fn control(
        message_type: MessageType,
        gid: u8,
        oid: u8,
        payload: &[u8],
    ) -> Result<Self, FrameError> {
        if payload.len() > u8::MAX as usize {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        let mut bytes = Vec::with_capacity(NCI_HEADER_SIZE + payload.len());
        bytes.push(message_type.bits() | (gid & GID_MASK));
        bytes.push(oid & OID_MASK);
        bytes.push(payload.len() as u8);
        bytes.extend_from_slice(payload);
        Self::from_bytes(bytes)
    }

    pub fn header(&self) -> &NciHeader {
        &self.header
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn gid(&self) -> u8 {
        self.header.gid
    }

    pub fn oid(&self) -> u8 {
        self.header.oid
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[NCI_HEADER_SIZE..]
    }

    /// First payload byte of a response, which NCI defines as the status.
    pub fn status(&self) -> Option<u8> {
        match self.header.message_type {
            MessageType::Response => self.payload().first().copied(),
            _ => None,
        }
    }

    /// Same group/opcode as `other` (used to pair a response with its command).
    pub fn same_opcode(&self, other: &NciFrame) -> bool {
        self.gid() == other.gid() && self.oid() == other.oid()
    }

    pub fn is(&self, message_type: MessageType, gid: u8, oid: u8) -> bool {
        self.header.message_type == message_type && self.gid() == gid && self.oid() == oid
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for NciFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NciFrame({} gid=0x{:02X} oid=0x{:02X} [{}])",
            self.header.message_type,
            self.gid(),
            self.oid(),
            hex(&self.bytes)
        )
    }
}

/// Space separated upper-case hex, used in log fields.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Negotiated NCI protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NciVersion {
    #[default]
    V1,
    V2,
}

impl NciVersion {
    /// Interpret a version byte as reported in CORE_RESET_RSP/NTF.
    ///
    /// Accepts both the bare major (`0x01`, `0x02`) and the NCI encoding
    /// with the major in the high nibble (`0x10`, `0x11`, `0x20`).
    pub fn from_version_byte(byte: u8) -> Option<Self> {
        let major = if byte > 0x0F { byte >> 4 } else { byte };
        match major {
            1 => Some(NciVersion::V1),
            2 => Some(NciVersion::V2),
            _ => None,
        }
    }

    /// CORE_INIT_CMD in the wire format of this generation.
    pub fn init_command(&self) -> &'static [u8] {
        match self {
            NciVersion::V1 => &CORE_INIT_CMD_V1,
            NciVersion::V2 => &CORE_INIT_CMD_V2,
        }
    }
}

impl fmt::Display for NciVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NciVersion::V1 => write!(f, "NCI 1.x"),
            NciVersion::V2 => write!(f, "NCI 2.0"),
        }
    }
}

/// What a CORE_RESET_RSP tells us about the protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// NCI 1.x response carrying the version inline.
    Version(NciVersion),
    /// NCI 2.0 response; the version follows in CORE_RESET_NTF.
    AwaitNotification,
}

/// Interpret a successful CORE_RESET_RSP.
pub fn parse_reset_response(rsp: &NciFrame) -> Result<ResetOutcome, FrameError> {
    let payload = rsp.payload();
    match payload.len() {
        0 => Err(FrameError::LengthMismatch {
            declared: 1,
            actual: 0,
        }),
        1 => Ok(ResetOutcome::AwaitNotification),
        _ => Ok(ResetOutcome::Version(
            NciVersion::from_version_byte(payload[1]).unwrap_or_default(),
        )),
    }
}

/// Version byte of an NCI 2.0 CORE_RESET_NTF (payload index 2).
pub fn reset_notification_version(ntf: &NciFrame) -> Option<NciVersion> {
    ntf.payload()
        .get(2)
        .and_then(|&b| NciVersion::from_version_byte(b))
}

/// Builder for CORE_SET_CONFIG_CMD.
///
/// Standard parameters use one-byte ids; proprietary ids (`0xA0xx`) are
/// written as two big-endian bytes.
#[derive(Debug, Default, Clone)]
pub struct SetConfig {
    count: usize,
    tlvs: Vec<u8>,
    /// Length of the first value that does not fit a one-byte length field.
    oversized: Option<usize>,
}

impl SetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, id: u16, value: &[u8]) -> Self {
        if id > 0xFF {
            self.tlvs.write_u16::<BigEndian>(id).unwrap_or_default();
        } else {
            self.tlvs.push(id as u8);
        }
        let Ok(len) = u8::try_from(value.len()) else {
            self.oversized.get_or_insert(value.len());
            return self;
        };
        self.tlvs.push(len);
        self.tlvs.extend_from_slice(value);
        self.count += 1;
        self
    }

    /// Append raw TLVs that already carry their own id/len encoding.
    pub fn raw(mut self, count: u8, tlvs: &[u8]) -> Self {
        self.count += usize::from(count);
        self.tlvs.extend_from_slice(tlvs);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn build(&self) -> Result<NciFrame, FrameError> {
        if let Some(len) = self.oversized {
            return Err(FrameError::PayloadTooLarge(len));
        }
        let count = u8::try_from(self.count)
            .map_err(|_| FrameError::PayloadTooLarge(self.tlvs.len() + 1))?;
        let mut payload = Vec::with_capacity(self.tlvs.len() + 1);
        payload.push(count);
        payload.extend_from_slice(&self.tlvs);
        NciFrame::control(
            MessageType::Command,
            GID_CORE,
            OID_CORE_SET_CONFIG,
            &payload,
        )
    }
}
