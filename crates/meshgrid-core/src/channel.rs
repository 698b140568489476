//! Group channels
//!
//! A channel is a name plus a pre-shared key. Frames carry only the
//! 1-byte channel hash `SHA256(psk)[0]`, so several channels may share a
//! hash and receivers try each candidate until one authenticates.
//!
//! The well-known MeshCore public channel is always installed.

use crate::crypto::{self, SharedSecret};
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use tracing::info;

/// PSK of the MeshCore public channel (`izOH6cXN6mrJ5e26oRXNcg==`)
pub const PUBLIC_CHANNEL_PSK: [u8; 16] = [
    0x8b, 0x33, 0x87, 0xe9, 0xc5, 0xcd, 0xea, 0x6a,
    0xc9, 0xe5, 0xed, 0xba, 0xa1, 0x15, 0xcd, 0x72,
];
pub const PUBLIC_CHANNEL_NAME: &str = "Public";
pub const MAX_CHANNEL_NAME_LEN: usize = 32;
/// Channels held at once, public channel included
pub const MAX_CHANNELS: usize = 20;

#[derive(Clone)]
pub struct Channel {
    name: String,
    psk: Vec<u8>,
    secret: SharedSecret,
    hash: u8,
}

impl Channel {
    pub fn new(name: &str, psk: &[u8]) -> MeshResult<Self> {
        let secret = SharedSecret::from_psk(psk)?;
        Ok(Self {
            name: name.chars().take(MAX_CHANNEL_NAME_LEN).collect(),
            psk: psk.to_vec(),
            secret,
            hash: crypto::channel_hash(psk),
        })
    }

    pub fn public() -> Self {
        Self {
            name: PUBLIC_CHANNEL_NAME.to_string(),
            psk: PUBLIC_CHANNEL_PSK.to_vec(),
            secret: SharedSecret::from_psk(&PUBLIC_CHANNEL_PSK)
                .unwrap_or_else(|_| SharedSecret::from_bytes([0; 32])),
            hash: crypto::channel_hash(&PUBLIC_CHANNEL_PSK),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u8 {
        self.hash
    }

    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    pub fn is_public(&self) -> bool {
        self.psk == PUBLIC_CHANNEL_PSK
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("hash", &format_args!("{:02x}", self.hash))
            .field("psk", &"[REDACTED]")
            .finish()
    }
}

/// Persisted channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub name: String,
    pub psk: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChannelTable {
    channels: Vec<Channel>,
}

impl ChannelTable {
    /// Table holding only the public channel
    pub fn new() -> Self {
        Self {
            channels: vec![Channel::public()],
        }
    }

    /// Add or replace a channel by name, returning its hash
    pub fn add(&mut self, name: &str, psk: &[u8]) -> MeshResult<u8> {
        let channel = Channel::new(name, psk)?;
        let hash = channel.hash;
        if let Some(existing) = self.channels.iter_mut().find(|c| c.name == channel.name) {
            *existing = channel;
        } else {
            if self.channels.len() >= MAX_CHANNELS {
                return Err(MeshError::Storage(format!(
                    "channel table full ({} channels)",
                    MAX_CHANNELS
                )));
            }
            info!("Added channel {:?} hash={:02x}", channel.name, hash);
            self.channels.push(channel);
        }
        Ok(hash)
    }

    /// Remove a channel by name; the public channel stays
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| c.is_public() || c.name != name);
        self.channels.len() != before
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Every channel whose hash matches
    pub fn candidates(&self, hash: u8) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(move |c| c.hash == hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Custom channels for persistence
    pub fn to_records(&self) -> Vec<ChannelRecord> {
        self.channels
            .iter()
            .filter(|c| !c.is_public())
            .map(|c| ChannelRecord {
                name: c.name.clone(),
                psk: c.psk.clone(),
            })
            .collect()
    }

    /// Re-add persisted channels, skipping invalid records
    pub fn restore(&mut self, records: &[ChannelRecord]) -> usize {
        records
            .iter()
            .filter(|r| self.add(&r.name, &r.psk).is_ok())
            .count()
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}
