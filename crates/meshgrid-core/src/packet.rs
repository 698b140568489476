//! Wire frame codec
//!
//! MeshCore-compatible framing. Multi-byte integers are little-endian.
//!
//! ```text
//! ┌──────────┬──────────────────────┬────────────┬──────────────┬───────────────┐
//! │ Header   │ Transport codes (4B) │ Path len   │ Path         │ Payload       │
//! │ (1B)     │ transport routes only│ (1B)       │ (0-64B)      │ (0-184B)      │
//! └──────────┴──────────────────────┴────────────┴──────────────┴───────────────┘
//!
//! Header byte:
//! ┌─────────┬──────────────────┬─────────────┐
//! │ 7..6    │ 5..2             │ 1..0        │
//! │ version │ payload type     │ route type  │
//! └─────────┴──────────────────┴─────────────┘
//! ```

use crate::error::CodecError;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest frame the radio carries
pub const MAX_PACKET_SIZE: usize = 255;
/// Largest payload after the path
pub const MAX_PAYLOAD_SIZE: usize = 184;
/// Largest number of hop hashes in a path
pub const MAX_PATH_SIZE: usize = 64;

/// Payload length produced by some radios looping an advert back with a trailing byte
const ADVERT_LOOPBACK_LEN: usize = 107;

/// How a frame travels through the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteType {
    /// Flood with 4 bytes of transport codes
    TransportFlood,
    /// Re-broadcast by every repeater
    Flood,
    /// Follow the path exactly
    Direct,
    /// Direct with 4 bytes of transport codes
    TransportDirect,
}

impl RouteType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => RouteType::TransportFlood,
            1 => RouteType::Flood,
            2 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            RouteType::TransportFlood => 0,
            RouteType::Flood => 1,
            RouteType::Direct => 2,
            RouteType::TransportDirect => 3,
        }
    }

    /// Whether transport codes follow the header
    pub fn has_transport_codes(self) -> bool {
        matches!(self, RouteType::TransportFlood | RouteType::TransportDirect)
    }

    pub fn is_flood(self) -> bool {
        matches!(self, RouteType::TransportFlood | RouteType::Flood)
    }
}

/// What the payload carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    Request,
    Response,
    TextMessage,
    Ack,
    Advert,
    GroupText,
    GroupData,
    AnonRequest,
    Path,
    Trace,
    Multipart,
    Control,
    RawCustom,
    /// Reserved values 12..=14
    Other(u8),
}

impl PayloadType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0 => PayloadType::Request,
            1 => PayloadType::Response,
            2 => PayloadType::TextMessage,
            3 => PayloadType::Ack,
            4 => PayloadType::Advert,
            5 => PayloadType::GroupText,
            6 => PayloadType::GroupData,
            7 => PayloadType::AnonRequest,
            8 => PayloadType::Path,
            9 => PayloadType::Trace,
            10 => PayloadType::Multipart,
            11 => PayloadType::Control,
            15 => PayloadType::RawCustom,
            other => PayloadType::Other(other),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            PayloadType::Request => 0,
            PayloadType::Response => 1,
            PayloadType::TextMessage => 2,
            PayloadType::Ack => 3,
            PayloadType::Advert => 4,
            PayloadType::GroupText => 5,
            PayloadType::GroupData => 6,
            PayloadType::AnonRequest => 7,
            PayloadType::Path => 8,
            PayloadType::Trace => 9,
            PayloadType::Multipart => 10,
            PayloadType::Control => 11,
            PayloadType::RawCustom => 15,
            PayloadType::Other(v) => v & 0x0F,
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadType::Request => "REQ",
            PayloadType::Response => "RESPONSE",
            PayloadType::TextMessage => "TXT_MSG",
            PayloadType::Ack => "ACK",
            PayloadType::Advert => "ADVERT",
            PayloadType::GroupText => "GRP_TXT",
            PayloadType::GroupData => "GRP_DATA",
            PayloadType::AnonRequest => "ANON_REQ",
            PayloadType::Path => "PATH",
            PayloadType::Trace => "TRACE",
            PayloadType::Multipart => "MULTIPART",
            PayloadType::Control => "CONTROL",
            PayloadType::RawCustom => "RAW_CUSTOM",
            PayloadType::Other(v) => return write!(f, "TYPE_{}", v),
        };
        f.write_str(name)
    }
}

/// Packed header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub route: RouteType,
    pub payload_type: PayloadType,
    /// Protocol generation (0 = MeshCore, 1 = v1)
    pub version: u8,
}

impl Header {
    pub fn new(route: RouteType, payload_type: PayloadType) -> Self {
        Self {
            route,
            payload_type,
            version: 0,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            route: RouteType::from_bits(byte),
            payload_type: PayloadType::from_bits(byte >> 2),
            version: (byte >> 6) & 0x03,
        }
    }

    pub fn as_byte(&self) -> u8 {
        self.route.to_bits() | (self.payload_type.to_bits() << 2) | ((self.version & 0x03) << 6)
    }
}

/// Receive-side link metadata, never serialized
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RxMetadata {
    /// dBm
    pub rssi: i16,
    /// dB
    pub snr: f32,
    pub rx_time_ms: u64,
}

/// A decoded mesh frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub header: Header,
    /// Only meaningful for transport routes
    pub transport_codes: [u16; 2],
    /// Hop hashes in traversal order
    pub path: Vec<u8>,
    pub payload: Vec<u8>,
    #[serde(skip)]
    pub rx: Option<RxMetadata>,
}

impl Packet {
    /// Create a version 0 packet with an empty path
    pub fn new(route: RouteType, payload_type: PayloadType, payload: Vec<u8>) -> Self {
        Self {
            header: Header::new(route, payload_type),
            transport_codes: [0; 2],
            path: Vec::new(),
            payload,
            rx: None,
        }
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.header.version = version & 0x03;
        self
    }

    pub fn with_transport_codes(mut self, codes: [u16; 2]) -> Self {
        self.transport_codes = codes;
        self
    }

    pub fn route(&self) -> RouteType {
        self.header.route
    }

    pub fn payload_type(&self) -> PayloadType {
        self.header.payload_type
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }

    pub fn path_len(&self) -> usize {
        self.path.len()
    }

    /// Bytes this packet occupies on the wire
    pub fn encoded_len(&self) -> usize {
        let transport = if self.header.route.has_transport_codes() { 4 } else { 0 };
        1 + transport + 1 + self.path.len() + self.payload.len()
    }

    /// Serialize into `buf`, returning the number of bytes written
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        if self.path.len() > MAX_PATH_SIZE {
            return Err(CodecError::PathTooLong(self.path.len()));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLong(self.payload.len()));
        }
        let needed = self.encoded_len();
        if needed > buf.len() {
            return Err(CodecError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }

        let mut pos = 0;
        buf[pos] = self.header.as_byte();
        pos += 1;

        if self.header.route.has_transport_codes() {
            LittleEndian::write_u16(&mut buf[pos..pos + 2], self.transport_codes[0]);
            LittleEndian::write_u16(&mut buf[pos + 2..pos + 4], self.transport_codes[1]);
            pos += 4;
        }

        buf[pos] = self.path.len() as u8;
        pos += 1;
        buf[pos..pos + self.path.len()].copy_from_slice(&self.path);
        pos += self.path.len();
        buf[pos..pos + self.payload.len()].copy_from_slice(&self.payload);
        pos += self.payload.len();

        Ok(pos)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; self.encoded_len()];
        let len = self.encode(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Parse a received frame
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::TooShort(buf.len()));
        }

        let header = Header::from_byte(buf[0]);
        let mut pos = 1;

        let mut transport_codes = [0u16; 2];
        if header.route.has_transport_codes() {
            if buf.len() < pos + 4 {
                return Err(CodecError::Truncated("transport codes"));
            }
            transport_codes[0] = LittleEndian::read_u16(&buf[pos..pos + 2]);
            transport_codes[1] = LittleEndian::read_u16(&buf[pos + 2..pos + 4]);
            pos += 4;
        }

        let path_len = *buf.get(pos).ok_or(CodecError::Truncated("path length"))? as usize;
        pos += 1;
        if path_len > MAX_PATH_SIZE {
            return Err(CodecError::PathTooLong(path_len));
        }
        if buf.len() < pos + path_len {
            return Err(CodecError::Truncated("path"));
        }
        let path = buf[pos..pos + path_len].to_vec();
        pos += path_len;

        let mut payload_len = buf.len() - pos;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLong(payload_len));
        }
        if header.payload_type == PayloadType::Advert && payload_len == ADVERT_LOOPBACK_LEN {
            payload_len -= 1;
        }
        let payload = buf[pos..pos + payload_len].to_vec();

        Ok(Self {
            header,
            transport_codes,
            path,
            payload,
            rx: None,
        })
    }

    /// One-byte hash used for duplicate suppression
    ///
    /// Covers only the payload type and payload, so copies of the same
    /// frame with longer paths collide on purpose.
    pub fn hash(&self) -> u8 {
        self.payload
            .iter()
            .fold(self.header.payload_type.to_bits(), |h, &b| (h ^ b).rotate_left(1))
    }

    /// Append a hop hash, refusing once the path is full
    pub fn path_append(&mut self, hop: u8) -> Result<(), CodecError> {
        if self.path.len() >= MAX_PATH_SIZE {
            return Err(CodecError::PathFull);
        }
        self.path.push(hop);
        Ok(())
    }

    pub fn contains_hop(&self, hop: u8) -> bool {
        self.path.contains(&hop)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} v{} path={} payload={}B",
            self.header.payload_type,
            self.header.route,
            self.header.version,
            self.path.len(),
            self.payload.len()
        )
    }
}
