//! Neighbor table
//!
//! Tracks every node whose advert we have accepted, keyed by its 32-byte
//! public key. Each entry caches the pairwise secret so messages to and
//! from the peer never repeat the ECDH, plus the v1 sequence counters.
//!
//! Capacity is bounded: a new node evicts the least recently seen entry.
//! Stale entries are removed by [`NeighborTable::prune`].

use crate::advert::{AdvertType, MAX_NAME_LEN};
use crate::crypto::{self, Identity, SharedSecret, PUBKEY_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Persisted record format
pub const NEIGHBOR_STORE_VERSION: u8 = 1;

/// Node role, inferred from the advert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Client,
    Repeater,
    Room,
}

/// Firmware family, guessed from naming conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Firmware {
    MeshCore,
    Meshgrid,
    Meshtastic,
}

/// Neighbor table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborConfig {
    /// Maximum tracked neighbors
    pub capacity: usize,
    /// Entries not heard from for this long are pruned
    pub timeout_ms: u64,
    /// Records written to the store
    pub persist_max: usize,
    /// Save after this many newly discovered neighbors
    ///
    /// Receive sequence watermarks ride along with these saves. Anything
    /// accepted since the last save can be replayed after a reboot unless
    /// the host calls `MeshNode::save_state` on shutdown.
    pub save_every: u32,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            timeout_ms: 15 * 60 * 1000,
            persist_max: 10,
            save_every: 5,
        }
    }
}

/// Per-type neighbor counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborCounts {
    pub clients: u32,
    pub repeaters: u32,
    pub rooms: u32,
}

impl NeighborCounts {
    fn slot(&mut self, node_type: NodeType) -> &mut u32 {
        match node_type {
            NodeType::Client => &mut self.clients,
            NodeType::Repeater => &mut self.repeaters,
            NodeType::Room => &mut self.rooms,
        }
    }

    fn increment(&mut self, node_type: NodeType) {
        *self.slot(node_type) += 1;
    }

    fn decrement(&mut self, node_type: NodeType) {
        let slot = self.slot(node_type);
        *slot = slot.saturating_sub(1);
    }
}

/// A known peer
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub public_key: [u8; PUBKEY_SIZE],
    /// MeshCore hash, `public_key[0]`
    pub hash: u8,
    pub v1_hash: u16,
    pub name: String,
    pub node_type: NodeType,
    pub firmware: Firmware,
    pub last_seen_ms: u64,
    /// Sender's clock in its last advert
    pub advert_timestamp: u32,
    pub rssi: i16,
    pub snr: f32,
    /// Fewest hops any advert took to reach us (`u8::MAX` = unknown)
    pub hops: u8,
    pub protocol_version: u8,
    secret: Option<SharedSecret>,
    pub last_seq_rx: u32,
    pub next_seq_tx: u32,
}

impl Neighbor {
    pub fn secret_valid(&self) -> bool {
        self.secret.is_some()
    }

    pub fn secret(&self) -> Option<&SharedSecret> {
        self.secret.as_ref()
    }

    pub fn supports_v1(&self) -> bool {
        self.protocol_version >= 1
    }

    /// Accept `seq` once; zero and anything at or below the watermark are replays
    pub fn verify_seq_rx(&mut self, seq: u32) -> bool {
        if seq == 0 || seq <= self.last_seq_rx {
            return false;
        }
        self.last_seq_rx = seq;
        true
    }

    /// Take the next outgoing sequence number; zero is never issued
    pub fn take_seq_tx(&mut self) -> u32 {
        let seq = self.next_seq_tx.max(1);
        self.next_seq_tx = match seq.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        seq
    }

    pub fn is_stale(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) > timeout_ms
    }

    pub fn snapshot(&self) -> NeighborSnapshot {
        NeighborSnapshot {
            hash: self.hash,
            public_key: self.public_key,
            name: self.name.clone(),
            node_type: self.node_type,
            firmware: self.firmware,
            last_seen_ms: self.last_seen_ms,
            rssi: self.rssi,
            snr: self.snr,
            hops: self.hops,
            protocol_version: self.protocol_version,
            secret_valid: self.secret_valid(),
        }
    }
}

/// Read-only view of a neighbor, free of key material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborSnapshot {
    pub hash: u8,
    pub public_key: [u8; PUBKEY_SIZE],
    pub name: String,
    pub node_type: NodeType,
    pub firmware: Firmware,
    pub last_seen_ms: u64,
    pub rssi: i16,
    pub snr: f32,
    pub hops: u8,
    pub protocol_version: u8,
    pub secret_valid: bool,
}

/// One accepted advert
#[derive(Debug, Clone)]
pub struct Sighting<'a> {
    pub public_key: &'a [u8; PUBKEY_SIZE],
    pub name: &'a str,
    pub adv_type: AdvertType,
    pub timestamp: u32,
    pub rssi: i16,
    pub snr: f32,
    pub hops: u8,
    pub protocol_version: u8,
}

/// What [`NeighborTable::update`] did
#[derive(Debug)]
pub enum NeighborChange {
    /// First sighting; carries the entry evicted to make room, if any
    Added { evicted: Option<Neighbor> },
    /// Known node announcing a different name
    Renamed,
    /// Known node, nothing but liveness changed
    Refreshed,
}

/// Persisted neighbor, secret excluded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub hash: u8,
    pub public_key: [u8; PUBKEY_SIZE],
    pub name: String,
    pub last_seq_rx: u32,
    pub next_seq_tx: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborStore {
    pub version: u8,
    pub neighbors: Vec<NeighborRecord>,
}

/// Keep printable ASCII only, at most 16 characters
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| (' '..='~').contains(c))
        .take(MAX_NAME_LEN)
        .collect()
}

/// Best-effort role guess from the advert type and naming conventions
pub fn infer_node_type(name: &str, adv_type: AdvertType) -> NodeType {
    match adv_type {
        AdvertType::Repeater => return NodeType::Repeater,
        AdvertType::Room => return NodeType::Room,
        _ => {}
    }
    if name.starts_with("rpt-")
        || name.starts_with("RPT")
        || name.contains("relay")
        || name.contains("Relay")
        || name.contains("repeater")
        || name.contains("Repeater")
    {
        NodeType::Repeater
    } else if name.starts_with("room-")
        || name.starts_with("Room")
        || name.contains("server")
        || name.contains("Server")
    {
        NodeType::Room
    } else {
        NodeType::Client
    }
}

pub fn infer_firmware(name: &str) -> Firmware {
    if name.starts_with("mg-") || name.starts_with("MG-") {
        Firmware::Meshgrid
    } else if name.starts_with("Meshtastic") || name.contains('!') {
        Firmware::Meshtastic
    } else {
        Firmware::MeshCore
    }
}

/// Bounded table of known peers
#[derive(Debug)]
pub struct NeighborTable {
    entries: Vec<Neighbor>,
    config: NeighborConfig,
    counts: NeighborCounts,
}

impl NeighborTable {
    pub fn new(config: NeighborConfig) -> Self {
        Self {
            entries: Vec::with_capacity(config.capacity.min(256)),
            config,
            counts: NeighborCounts::default(),
        }
    }

    pub fn config(&self) -> &NeighborConfig {
        &self.config
    }

    /// First neighbor whose 1-byte hash matches
    pub fn find(&self, hash: u8) -> Option<&Neighbor> {
        self.entries.iter().find(|n| n.hash == hash)
    }

    pub fn find_mut(&mut self, hash: u8) -> Option<&mut Neighbor> {
        self.entries.iter_mut().find(|n| n.hash == hash)
    }

    pub fn get(&self, public_key: &[u8; PUBKEY_SIZE]) -> Option<&Neighbor> {
        self.entries.iter().find(|n| &n.public_key == public_key)
    }

    pub fn get_mut(&mut self, public_key: &[u8; PUBKEY_SIZE]) -> Option<&mut Neighbor> {
        self.entries.iter_mut().find(|n| &n.public_key == public_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Neighbor> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counts(&self) -> NeighborCounts {
        self.counts
    }

    pub fn snapshot(&self) -> Vec<NeighborSnapshot> {
        self.entries.iter().map(Neighbor::snapshot).collect()
    }

    /// Record an advert from `sighting.public_key`
    pub fn update(&mut self, identity: &Identity, sighting: &Sighting<'_>, now_ms: u64) -> NeighborChange {
        let name = sanitize_name(sighting.name);

        if let Some(existing) = self.entries.iter_mut().find(|n| &n.public_key == sighting.public_key) {
            let renamed = existing.name != name;
            if renamed {
                let node_type = infer_node_type(&name, sighting.adv_type);
                if node_type != existing.node_type {
                    self.counts.decrement(existing.node_type);
                    self.counts.increment(node_type);
                    existing.node_type = node_type;
                }
                existing.firmware = infer_firmware(&name);
                debug!("Neighbor {:02x} renamed {:?} -> {:?}", existing.hash, existing.name, name);
                existing.name = name;
            }
            existing.last_seen_ms = now_ms;
            existing.advert_timestamp = sighting.timestamp;
            existing.rssi = sighting.rssi;
            existing.snr = sighting.snr;
            existing.protocol_version = sighting.protocol_version;
            existing.hops = existing.hops.min(sighting.hops);

            return if renamed {
                NeighborChange::Renamed
            } else {
                NeighborChange::Refreshed
            };
        }

        let evicted = if self.entries.len() >= self.config.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let secret = match identity.shared_secret(sighting.public_key) {
            Ok(secret) => Some(secret),
            Err(e) => {
                debug!("No shared secret for {:02x}: {}", sighting.public_key[0], e);
                None
            }
        };

        let node_type = infer_node_type(&name, sighting.adv_type);
        let neighbor = Neighbor {
            public_key: *sighting.public_key,
            hash: sighting.public_key[0],
            v1_hash: crypto::v1_hash(sighting.public_key),
            firmware: infer_firmware(&name),
            name,
            node_type,
            last_seen_ms: now_ms,
            advert_timestamp: sighting.timestamp,
            rssi: sighting.rssi,
            snr: sighting.snr,
            hops: sighting.hops,
            protocol_version: sighting.protocol_version,
            secret,
            last_seq_rx: 0,
            next_seq_tx: 1,
        };

        info!(
            "New neighbor {:02x} {:?} ({:?}, {:?}, v{}, {} hops)",
            neighbor.hash, neighbor.name, neighbor.node_type, neighbor.firmware,
            neighbor.protocol_version, neighbor.hops
        );
        self.counts.increment(node_type);
        self.entries.push(neighbor);

        NeighborChange::Added { evicted }
    }

    /// Remove the least recently seen entry
    fn evict_oldest(&mut self) -> Option<Neighbor> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| n.last_seen_ms)
            .map(|(i, _)| i)?;
        let evicted = self.entries.swap_remove(idx);
        self.counts.decrement(evicted.node_type);
        info!("Evicted neighbor {:02x} {:?}", evicted.hash, evicted.name);
        Some(evicted)
    }

    /// Drop entries not heard from within the timeout
    pub fn prune(&mut self, now_ms: u64) -> Vec<Neighbor> {
        let timeout = self.config.timeout_ms;
        let (stale, fresh): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|n| n.is_stale(now_ms, timeout));
        self.entries = fresh;
        for n in &stale {
            self.counts.decrement(n.node_type);
            info!("Neighbor {:02x} {:?} timed out", n.hash, n.name);
        }
        stale
    }

    /// Records for the most recently seen neighbors holding a valid secret
    pub fn to_store(&self) -> NeighborStore {
        let mut candidates: Vec<&Neighbor> = self.entries.iter().filter(|n| n.secret_valid()).collect();
        candidates.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));

        NeighborStore {
            version: NEIGHBOR_STORE_VERSION,
            neighbors: candidates
                .into_iter()
                .take(self.config.persist_max)
                .map(|n| NeighborRecord {
                    hash: n.hash,
                    public_key: n.public_key,
                    name: n.name.clone(),
                    last_seq_rx: n.last_seq_rx,
                    next_seq_tx: n.next_seq_tx,
                })
                .collect(),
        }
    }

    /// Reload persisted neighbors, recomputing their secrets
    ///
    /// Returns how many were restored. Stores of another format version
    /// are ignored.
    pub fn restore(&mut self, identity: &Identity, store: &NeighborStore, now_ms: u64) -> usize {
        if store.version != NEIGHBOR_STORE_VERSION {
            info!("Ignoring neighbor store version {}", store.version);
            return 0;
        }

        let mut restored = 0;
        for record in store.neighbors.iter().take(self.config.persist_max) {
            if self.entries.len() >= self.config.capacity {
                break;
            }
            if record.hash != record.public_key[0] || self.get(&record.public_key).is_some() {
                continue;
            }
            let Ok(secret) = identity.shared_secret(&record.public_key) else {
                continue;
            };
            let name = sanitize_name(&record.name);
            let node_type = infer_node_type(&name, AdvertType::None);
            self.entries.push(Neighbor {
                public_key: record.public_key,
                hash: record.hash,
                v1_hash: crypto::v1_hash(&record.public_key),
                firmware: infer_firmware(&name),
                name,
                node_type,
                last_seen_ms: now_ms,
                advert_timestamp: 0,
                rssi: 0,
                snr: 0.0,
                hops: u8::MAX,
                protocol_version: 0,
                secret: Some(secret),
                last_seq_rx: record.last_seq_rx,
                next_seq_tx: record.next_seq_tx.max(1),
            });
            self.counts.increment(node_type);
            restored += 1;
        }
        restored
    }
}

impl Default for NeighborTable {
    fn default() -> Self {
        Self::new(NeighborConfig::default())
    }
}
