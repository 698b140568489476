//! Node advertisements
//!
//! ```text
//! ┌──────────────┬────────────┬────────────────┬───────────────────────┐
//! │ pubkey (32B) │ ts (4B LE) │ signature (64B)│ app_data              │
//! └──────────────┴────────────┴────────────────┴───────────────────────┘
//!
//! app_data:
//! ┌───────┬──────────────┬────────────┬────────────┬─────────────────────┬──────────┐
//! │ flags │ lat,lon (8B) │ feat1 (2B) │ feat2 (2B) │ ttl + bloom (33B)   │ name     │
//! │       │ if 0x10      │ if 0x20    │ if 0x40    │ version 1 only      │ if 0x80  │
//! └───────┴──────────────┴────────────┴────────────┴─────────────────────┴──────────┘
//! ```
//!
//! The signature covers `pubkey || ts || app_data`. The name runs to the
//! end of the payload without a terminator.

use crate::bloom::{BloomFilter, BLOOM_SIZE};
use crate::crypto::{self, Identity, PUBKEY_SIZE, SIGNATURE_SIZE};
use crate::error::CodecError;
use crate::packet::{Packet, PayloadType, RouteType};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Bytes before app_data
pub const ADVERT_HEADER_SIZE: usize = PUBKEY_SIZE + 4 + SIGNATURE_SIZE;
/// Header plus the flags byte
pub const MIN_ADVERT_SIZE: usize = ADVERT_HEADER_SIZE + 1;
pub const MAX_NAME_LEN: usize = 16;
/// Payload length the codec trims by one byte
const LOOPBACK_TRIM_LEN: usize = 107;

pub const ADV_TYPE_MASK: u8 = 0x0F;
pub const ADV_LATLON: u8 = 0x10;
pub const ADV_FEAT1: u8 = 0x20;
pub const ADV_FEAT2: u8 = 0x40;
pub const ADV_NAME: u8 = 0x80;

/// feat2 bit announcing v1 support; MeshCore parsers skip feat2
pub const CAP_V1: u16 = 0x0001;

/// Node role carried in the flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertType {
    None,
    Chat,
    Repeater,
    Room,
    Sensor,
    Unknown(u8),
}

impl AdvertType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & ADV_TYPE_MASK {
            0 => AdvertType::None,
            1 => AdvertType::Chat,
            2 => AdvertType::Repeater,
            3 => AdvertType::Room,
            4 => AdvertType::Sensor,
            other => AdvertType::Unknown(other),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            AdvertType::None => 0,
            AdvertType::Chat => 1,
            AdvertType::Repeater => 2,
            AdvertType::Room => 3,
            AdvertType::Sensor => 4,
            AdvertType::Unknown(v) => v & ADV_TYPE_MASK,
        }
    }
}

/// Discovery fields of a version 1 beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryInfo {
    /// Hops the beacon may travel
    pub ttl: u8,
    pub bloom: BloomFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppData {
    pub adv_type: AdvertType,
    /// Micro-degrees
    pub location: Option<(i32, i32)>,
    pub feat1: Option<u16>,
    pub feat2: Option<u16>,
    pub discovery: Option<DiscoveryInfo>,
    pub name: Option<String>,
}

impl AppData {
    /// Chat node announcing only its name
    pub fn named(name: &str) -> Self {
        Self {
            adv_type: AdvertType::Chat,
            location: None,
            feat1: None,
            feat2: None,
            discovery: None,
            name: Some(name.to_string()),
        }
    }

    pub fn supports_v1(&self) -> bool {
        self.feat2.is_some_and(|f| f & CAP_V1 != 0)
    }

    pub fn flags(&self) -> u8 {
        let mut flags = self.adv_type.to_bits();
        if self.location.is_some() {
            flags |= ADV_LATLON;
        }
        if self.feat1.is_some() {
            flags |= ADV_FEAT1;
        }
        if self.feat2.is_some() {
            flags |= ADV_FEAT2;
        }
        if self.name.is_some() {
            flags |= ADV_NAME;
        }
        flags
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.flags()];
        if let Some((lat, lon)) = self.location {
            out.extend_from_slice(&lat.to_le_bytes());
            out.extend_from_slice(&lon.to_le_bytes());
        }
        if let Some(f) = self.feat1 {
            out.extend_from_slice(&f.to_le_bytes());
        }
        if let Some(f) = self.feat2 {
            out.extend_from_slice(&f.to_le_bytes());
        }
        if let Some(d) = &self.discovery {
            out.push(d.ttl);
            out.extend_from_slice(&d.bloom.encode());
        }
        if let Some(name) = &self.name {
            out.extend_from_slice(truncate_name(name).as_bytes());
        }
        out
    }

    /// Parse app_data; discovery fields are only read for version 1 frames
    pub fn parse(data: &[u8], version: u8) -> Result<Self, CodecError> {
        let (&flags, mut rest) = data
            .split_first()
            .ok_or(CodecError::Truncated("advert flags"))?;

        let location = if flags & ADV_LATLON != 0 {
            let b = take(&mut rest, 8, "advert location")?;
            Some((LittleEndian::read_i32(&b[..4]), LittleEndian::read_i32(&b[4..])))
        } else {
            None
        };
        let feat1 = if flags & ADV_FEAT1 != 0 {
            Some(LittleEndian::read_u16(take(&mut rest, 2, "advert feat1")?))
        } else {
            None
        };
        let feat2 = if flags & ADV_FEAT2 != 0 {
            Some(LittleEndian::read_u16(take(&mut rest, 2, "advert feat2")?))
        } else {
            None
        };
        let discovery = if version >= 1 {
            let b = take(&mut rest, 1 + BLOOM_SIZE, "discovery fields")?;
            let mut bloom = [0u8; BLOOM_SIZE];
            bloom.copy_from_slice(&b[1..]);
            Some(DiscoveryInfo {
                ttl: b[0],
                bloom: BloomFilter::decode(&bloom),
            })
        } else {
            None
        };

        let name = if flags & ADV_NAME != 0 {
            let len = rest.len().min(MAX_NAME_LEN);
            Some(String::from_utf8_lossy(&rest[..len]).into_owned())
        } else {
            None
        };

        Ok(Self {
            adv_type: AdvertType::from_bits(flags),
            location,
            feat1,
            feat2,
            discovery,
            name,
        })
    }
}

fn take<'a>(rest: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
    if rest.len() < n {
        return Err(CodecError::Truncated(what));
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

/// Cut a name to at most 16 bytes on a char boundary
fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advert {
    pub public_key: [u8; PUBKEY_SIZE],
    pub timestamp: u32,
    pub signature: [u8; SIGNATURE_SIZE],
    pub app_data: AppData,
    /// app_data exactly as received, for signature checks
    raw_app_data: Vec<u8>,
}

impl Advert {
    /// Build and sign an advert for `identity`
    pub fn signed(identity: &Identity, timestamp: u32, mut app_data: AppData) -> Self {
        let mut raw_app_data = app_data.encode();
        // Receivers trim 107-byte advert payloads; grow past that with an empty feat1
        if ADVERT_HEADER_SIZE + raw_app_data.len() == LOOPBACK_TRIM_LEN && app_data.feat1.is_none() {
            app_data.feat1 = Some(0);
            raw_app_data = app_data.encode();
        }
        let public_key = *identity.public_key();
        let signature = identity.sign(&signed_message(&public_key, timestamp, &raw_app_data));
        Self {
            public_key,
            timestamp,
            signature,
            app_data,
            raw_app_data,
        }
    }

    pub fn parse(payload: &[u8], version: u8) -> Result<Self, CodecError> {
        if payload.len() < MIN_ADVERT_SIZE {
            return Err(CodecError::TooShort(payload.len()));
        }
        let mut public_key = [0u8; PUBKEY_SIZE];
        public_key.copy_from_slice(&payload[..PUBKEY_SIZE]);
        let timestamp = LittleEndian::read_u32(&payload[PUBKEY_SIZE..PUBKEY_SIZE + 4]);
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&payload[PUBKEY_SIZE + 4..ADVERT_HEADER_SIZE]);
        let raw_app_data = payload[ADVERT_HEADER_SIZE..].to_vec();
        let app_data = AppData::parse(&raw_app_data, version)?;

        Ok(Self {
            public_key,
            timestamp,
            signature,
            app_data,
            raw_app_data,
        })
    }

    /// MeshCore hash of the advertiser
    pub fn hash(&self) -> u8 {
        self.public_key[0]
    }

    pub fn verify(&self) -> bool {
        let message = signed_message(&self.public_key, self.timestamp, &self.raw_app_data);
        crypto::verify_signature(&self.public_key, &message, &self.signature)
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ADVERT_HEADER_SIZE + self.raw_app_data.len());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.raw_app_data);
        out
    }
}

fn signed_message(public_key: &[u8; PUBKEY_SIZE], timestamp: u32, app_data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(PUBKEY_SIZE + 4 + app_data.len());
    message.extend_from_slice(public_key);
    message.extend_from_slice(&timestamp.to_le_bytes());
    message.extend_from_slice(app_data);
    message
}

/// Flood advert announcing `name`
pub fn build_advertisement(identity: &Identity, name: &str, timestamp: u32) -> Packet {
    let advert = Advert::signed(identity, timestamp, AppData::named(name));
    Packet::new(RouteType::Flood, PayloadType::Advert, advert.to_payload())
}
