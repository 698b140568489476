//! Message layer: the two payload generations and the protocol selector
//!
//! ## v0 (MeshCore)
//!
//! ```text
//! TXT_MSG:  dest(1) src(1) | mac(2) AES-128-ECB[ ts(4 LE) flags(1) text ]
//! GRP_TXT:  chan(1)        | mac(2) AES-128-ECB[ ts(4 LE) flags(1) "name: text" ]
//! ```
//!
//! ## v1
//!
//! The whole payload is sealed; addressing lives inside the plaintext.
//! Multi-byte fields are big-endian.
//!
//! ```text
//! payload:  nonce(12) | AES-256-GCM[ plaintext ] | tag(16)
//! DM:       dest(2) src(2) seq(4) ts(4) text
//! channel:  chan(1) src(2) ts(4) text
//! ```
//!
//! Receivers cannot tell which key sealed a v1 payload, so they try each
//! candidate secret until the tag verifies.

use crate::crypto::{
    self, SharedSecret, AES_BLOCK_SIZE, V0_MAC_SIZE, V1_NONCE_SIZE, V1_TAG_SIZE,
};
use crate::error::{CodecError, MeshError, MeshResult};
use crate::packet::MAX_PAYLOAD_SIZE;
use crate::neighbor::Neighbor;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Plain text message type in the v0 flags byte
pub const TXT_TYPE_PLAIN: u8 = 0;

const V0_DIRECT_PREFIX: usize = 2;
const V0_GROUP_PREFIX: usize = 1;
const V0_TEXT_HEADER: usize = 5;
const V1_DIRECT_HEADER: usize = 12;
const V1_GROUP_HEADER: usize = 7;
/// Smallest sealed v1 payload (a channel message with no text)
pub const V1_MIN_PAYLOAD: usize = V1_NONCE_SIZE + V1_GROUP_HEADER + V1_TAG_SIZE;

/// Which payload generation to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    V0,
    V1,
}

/// What to do when v1 cannot be used with a v1-capable peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FallbackPolicy {
    /// Downgrade to v0 for that message
    #[default]
    Fallback,
    /// Refuse rather than downgrade
    Strict,
}

/// Preferred generation for `peer`
pub fn select_protocol(peer: &Neighbor, v1_enabled: bool) -> Protocol {
    if v1_enabled && peer.supports_v1() {
        Protocol::V1
    } else {
        Protocol::V0
    }
}

/// Longest text that fits a v0 direct message
pub fn max_v0_direct_text() -> usize {
    v0_capacity(MAX_PAYLOAD_SIZE - V0_DIRECT_PREFIX) - V0_TEXT_HEADER
}

/// Longest "name: text" that fits a v0 group message
pub fn max_v0_group_text() -> usize {
    v0_capacity(MAX_PAYLOAD_SIZE - V0_GROUP_PREFIX) - V0_TEXT_HEADER
}

pub fn max_v1_direct_text() -> usize {
    MAX_PAYLOAD_SIZE - V1_NONCE_SIZE - V1_TAG_SIZE - V1_DIRECT_HEADER
}

pub fn max_v1_group_text() -> usize {
    MAX_PAYLOAD_SIZE - V1_NONCE_SIZE - V1_TAG_SIZE - V1_GROUP_HEADER
}

/// Plaintext bytes available once MAC and block padding are accounted for
fn v0_capacity(room: usize) -> usize {
    (room - V0_MAC_SIZE) / AES_BLOCK_SIZE * AES_BLOCK_SIZE
}

/// Text with trailing zero padding removed
fn decode_text(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decrypted v0 direct message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V0Direct {
    pub dest: u8,
    pub src: u8,
    pub timestamp: u32,
    pub flags: u8,
    pub text: String,
}

/// Decrypted group message (either generation)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupText {
    pub channel_hash: u8,
    /// v1 sender hash; v0 carries the sender in the text
    pub src: Option<u16>,
    pub timestamp: u32,
    pub text: String,
}

/// Decrypted v1 direct message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1Direct {
    pub dest: u16,
    pub src: u16,
    pub seq: u32,
    pub timestamp: u32,
    pub text: String,
}

/// Peek at the routing bytes of a v0 direct message
pub fn v0_direct_addresses(payload: &[u8]) -> Option<(u8, u8)> {
    match payload {
        [dest, src, ..] => Some((*dest, *src)),
        _ => None,
    }
}

pub fn encode_v0_direct(
    secret: &SharedSecret,
    dest: u8,
    src: u8,
    timestamp: u32,
    text: &str,
) -> MeshResult<Vec<u8>> {
    if text.len() > max_v0_direct_text() {
        return Err(MeshError::MessageTooLong(text.len()));
    }
    let mut plain = Vec::with_capacity(V0_TEXT_HEADER + text.len());
    plain.extend_from_slice(&timestamp.to_le_bytes());
    plain.push(TXT_TYPE_PLAIN);
    plain.extend_from_slice(text.as_bytes());

    let mut payload = vec![dest, src];
    payload.extend_from_slice(&crypto::v0_encrypt(secret, &plain)?);
    Ok(payload)
}

pub fn decode_v0_direct(secret: &SharedSecret, payload: &[u8]) -> MeshResult<V0Direct> {
    let (dest, src) = v0_direct_addresses(payload).ok_or(CodecError::TooShort(payload.len()))?;
    let plain = crypto::v0_decrypt(secret, &payload[V0_DIRECT_PREFIX..])?;
    if plain.len() < V0_TEXT_HEADER {
        return Err(CodecError::Malformed("direct message").into());
    }
    Ok(V0Direct {
        dest,
        src,
        timestamp: LittleEndian::read_u32(&plain[..4]),
        flags: plain[4],
        text: decode_text(&plain[V0_TEXT_HEADER..]),
    })
}

pub fn encode_v0_group(
    secret: &SharedSecret,
    channel_hash: u8,
    timestamp: u32,
    sender: &str,
    text: &str,
) -> MeshResult<Vec<u8>> {
    let body = format!("{}: {}", sender, text);
    if body.len() > max_v0_group_text() {
        return Err(MeshError::MessageTooLong(body.len()));
    }
    let mut plain = Vec::with_capacity(V0_TEXT_HEADER + body.len());
    plain.extend_from_slice(&timestamp.to_le_bytes());
    plain.push(TXT_TYPE_PLAIN);
    plain.extend_from_slice(body.as_bytes());

    let mut payload = vec![channel_hash];
    payload.extend_from_slice(&crypto::v0_encrypt(secret, &plain)?);
    Ok(payload)
}

pub fn decode_v0_group(secret: &SharedSecret, payload: &[u8]) -> MeshResult<GroupText> {
    let (&channel_hash, sealed) = payload
        .split_first()
        .ok_or(CodecError::TooShort(payload.len()))?;
    let plain = crypto::v0_decrypt(secret, sealed)?;
    if plain.len() < V0_TEXT_HEADER {
        return Err(CodecError::Malformed("group message").into());
    }
    Ok(GroupText {
        channel_hash,
        src: None,
        timestamp: LittleEndian::read_u32(&plain[..4]),
        text: decode_text(&plain[V0_TEXT_HEADER..]),
    })
}

pub fn encode_v1_direct(
    secret: &SharedSecret,
    nonce: &[u8; V1_NONCE_SIZE],
    message: &V1Direct,
) -> MeshResult<Vec<u8>> {
    if message.text.len() > max_v1_direct_text() {
        return Err(MeshError::MessageTooLong(message.text.len()));
    }
    let mut plain = [0u8; V1_DIRECT_HEADER].to_vec();
    BigEndian::write_u16(&mut plain[0..2], message.dest);
    BigEndian::write_u16(&mut plain[2..4], message.src);
    BigEndian::write_u32(&mut plain[4..8], message.seq);
    BigEndian::write_u32(&mut plain[8..12], message.timestamp);
    plain.extend_from_slice(message.text.as_bytes());
    Ok(crypto::v1_encrypt(secret, nonce, &plain)?)
}

pub fn decode_v1_direct(secret: &SharedSecret, payload: &[u8]) -> MeshResult<V1Direct> {
    let plain = crypto::v1_decrypt(secret, payload)?;
    if plain.len() < V1_DIRECT_HEADER {
        return Err(CodecError::Malformed("v1 direct message").into());
    }
    Ok(V1Direct {
        dest: BigEndian::read_u16(&plain[0..2]),
        src: BigEndian::read_u16(&plain[2..4]),
        seq: BigEndian::read_u32(&plain[4..8]),
        timestamp: BigEndian::read_u32(&plain[8..12]),
        text: String::from_utf8_lossy(&plain[V1_DIRECT_HEADER..]).into_owned(),
    })
}

pub fn encode_v1_group(
    secret: &SharedSecret,
    nonce: &[u8; V1_NONCE_SIZE],
    channel_hash: u8,
    src: u16,
    timestamp: u32,
    text: &str,
) -> MeshResult<Vec<u8>> {
    if text.len() > max_v1_group_text() {
        return Err(MeshError::MessageTooLong(text.len()));
    }
    let mut plain = vec![channel_hash, 0, 0, 0, 0, 0, 0];
    BigEndian::write_u16(&mut plain[1..3], src);
    BigEndian::write_u32(&mut plain[3..7], timestamp);
    plain.extend_from_slice(text.as_bytes());
    Ok(crypto::v1_encrypt(secret, nonce, &plain)?)
}

pub fn decode_v1_group(secret: &SharedSecret, payload: &[u8]) -> MeshResult<GroupText> {
    let plain = crypto::v1_decrypt(secret, payload)?;
    if plain.len() < V1_GROUP_HEADER {
        return Err(CodecError::Malformed("v1 group message").into());
    }
    Ok(GroupText {
        channel_hash: plain[0],
        src: Some(BigEndian::read_u16(&plain[1..3])),
        timestamp: BigEndian::read_u32(&plain[3..7]),
        text: String::from_utf8_lossy(&plain[V1_GROUP_HEADER..]).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryptoError;

    fn secret() -> SharedSecret {
        SharedSecret::from_bytes([0x5A; 32])
    }

    #[test]
    fn test_capacities() {
        assert_eq!(max_v0_direct_text(), 171);
        assert_eq!(max_v0_group_text(), 171);
        assert_eq!(max_v1_direct_text(), 144);
        assert_eq!(max_v1_group_text(), 149);
    }

    #[test]
    fn test_v0_direct_roundtrip() {
        let payload = encode_v0_direct(&secret(), 0xAA, 0xBB, 1_700_000_000, "hi there").unwrap();
        assert_eq!(&payload[..2], &[0xAA, 0xBB]);
        assert_eq!(v0_direct_addresses(&payload), Some((0xAA, 0xBB)));

        let msg = decode_v0_direct(&secret(), &payload).unwrap();
        assert_eq!(msg.timestamp, 1_700_000_000);
        assert_eq!(msg.flags, TXT_TYPE_PLAIN);
        assert_eq!(msg.text, "hi there");
    }

    #[test]
    fn test_v0_direct_longest_fits() {
        let text = "x".repeat(max_v0_direct_text());
        let payload = encode_v0_direct(&secret(), 1, 2, 0, &text).unwrap();
        assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        assert!(matches!(
            encode_v0_direct(&secret(), 1, 2, 0, &format!("{}y", text)),
            Err(MeshError::MessageTooLong(_))
        ));
    }

    #[test]
    fn test_v0_wrong_key() {
        let payload = encode_v0_direct(&secret(), 1, 2, 0, "x").unwrap();
        let other = SharedSecret::from_bytes([0x5B; 32]);
        assert!(matches!(
            decode_v0_direct(&other, &payload),
            Err(MeshError::Crypto(CryptoError::AuthenticationFailed))
        ));
    }

    #[test]
    fn test_v0_group_roundtrip() {
        let payload = encode_v0_group(&secret(), 0x11, 99, "alice", "hello all").unwrap();
        assert_eq!(payload[0], 0x11);
        let msg = decode_v0_group(&secret(), &payload).unwrap();
        assert_eq!(msg.text, "alice: hello all");
        assert_eq!(msg.timestamp, 99);
        assert_eq!(msg.src, None);
    }

    #[test]
    fn test_v1_direct_roundtrip() {
        let nonce = [7u8; V1_NONCE_SIZE];
        let message = V1Direct {
            dest: 0x1234,
            src: 0xABCD,
            seq: 1,
            timestamp: 1_700_000_001,
            text: "sealed".into(),
        };
        let payload = encode_v1_direct(&secret(), &nonce, &message).unwrap();
        assert_eq!(&payload[..V1_NONCE_SIZE], &nonce);
        assert_eq!(payload.len(), V1_NONCE_SIZE + V1_DIRECT_HEADER + 6 + V1_TAG_SIZE);
        assert_eq!(decode_v1_direct(&secret(), &payload).unwrap(), message);

        let other = SharedSecret::from_bytes([1; 32]);
        assert!(decode_v1_direct(&other, &payload).is_err());
    }

    #[test]
    fn test_v1_group_roundtrip() {
        let nonce = [9u8; V1_NONCE_SIZE];
        let payload = encode_v1_group(&secret(), &nonce, 0x42, 0xBEEF, 5, "to the group").unwrap();
        assert!(payload.len() >= V1_MIN_PAYLOAD);
        let msg = decode_v1_group(&secret(), &payload).unwrap();
        assert_eq!(msg.channel_hash, 0x42);
        assert_eq!(msg.src, Some(0xBEEF));
        assert_eq!(msg.text, "to the group");
    }

    #[test]
    fn test_v1_too_long() {
        let text = "z".repeat(max_v1_direct_text() + 1);
        let message = V1Direct { dest: 1, src: 2, seq: 1, timestamp: 0, text };
        assert!(matches!(
            encode_v1_direct(&secret(), &[0; 12], &message),
            Err(MeshError::MessageTooLong(145))
        ));
    }
}
