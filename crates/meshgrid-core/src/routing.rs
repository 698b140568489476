//! Flood routing
//!
//! MeshCore forwards by managed flooding: every repeater re-broadcasts a
//! flood frame once, appending its own 1-byte hash to the path. The path
//! doubles as loop protection (a node never forwards a frame that already
//! carries its hash) and as the hop count.
//!
//! Re-broadcasts are staggered. Frames that have travelled far wait less,
//! so the flood front keeps moving outward, and a random component breaks
//! ties between repeaters that heard the same frame.
//!
//! This module also holds the receive-side guards that run before any
//! payload is looked at: the duplicate ring and the per-source rate limiter.

use crate::packet::{Packet, PayloadType, RouteType, MAX_PATH_SIZE};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Base retransmit delay
pub const RETRANSMIT_BASE_MS: u64 = 100;
/// Upper bound for any retransmit delay
pub const RETRANSMIT_MAX_MS: u64 = 5000;
/// Priority given to frames that have not travelled yet
pub const BASE_PRIORITY: u8 = 10;

/// What this node does with other nodes' traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceMode {
    /// Endpoint only, never forwards
    #[default]
    Client,
    Repeater,
    /// Room server; forwards like a repeater
    Room,
}

/// Whether to re-broadcast a received frame
pub fn should_forward(packet: &Packet, local_hash: u8, mode: DeviceMode) -> bool {
    if mode == DeviceMode::Client {
        return false;
    }
    if !packet.route().is_flood() {
        return false;
    }
    !packet.contains_hop(local_hash)
}

/// Collision-avoidance delay before re-broadcasting
///
/// `base + (64 - path_len) * 10 + random_byte * base / 256`, capped at 5 s.
pub fn retransmit_delay(packet: &Packet, random_byte: u8) -> u64 {
    let hops_left = MAX_PATH_SIZE.saturating_sub(packet.path_len()) as u64;
    let delay = RETRANSMIT_BASE_MS + hops_left * 10 + random_byte as u64 * RETRANSMIT_BASE_MS / 256;
    delay.min(RETRANSMIT_MAX_MS)
}

/// Queue priority for a forwarded frame (lower is sooner)
pub fn forward_priority(packet: &Packet) -> u8 {
    let path_len = packet.path_len().min(u8::MAX as usize) as u8;
    BASE_PRIORITY.saturating_sub(path_len).max(1)
}

/// Best guess at who originated a frame, for rate limiting
///
/// Returns 0 when unknown.
pub fn source_hash(packet: &Packet) -> u8 {
    if packet.route() == RouteType::Flood {
        if let Some(&last) = packet.path.last() {
            return last;
        }
    }
    match packet.payload_type() {
        PayloadType::Advert if packet.payload.len() >= 32 => packet.payload[0],
        PayloadType::TextMessage | PayloadType::GroupText if packet.payload.len() >= 2 => {
            packet.payload[1]
        }
        _ => 0,
    }
}

/// Duplicate suppression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Ring size
    pub slots: usize,
    /// A hash seen within this window is a duplicate
    pub window_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            slots: 32,
            window_ms: 60 * 1000,
        }
    }
}

/// Ring of recently seen frame hashes
#[derive(Debug)]
pub struct SeenTable {
    entries: Vec<Option<(u8, u64)>>,
    next: usize,
    window_ms: u64,
}

impl SeenTable {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            entries: vec![None; config.slots.max(1)],
            next: 0,
            window_ms: config.window_ms,
        }
    }

    /// True if `hash` was seen within the window; otherwise records it
    pub fn check_and_insert(&mut self, hash: u8, now_ms: u64) -> bool {
        let window = self.window_ms;
        let seen = self.entries.iter().flatten().any(|&(h, t)| {
            h == hash && now_ms.saturating_sub(t) < window
        });
        if seen {
            return true;
        }
        self.entries[self.next] = Some((hash, now_ms));
        self.next = (self.next + 1) % self.entries.len();
        false
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
        self.next = 0;
    }
}

impl Default for SeenTable {
    fn default() -> Self {
        Self::new(&DedupConfig::default())
    }
}

/// Per-source rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Frames allowed per source within the window
    pub max_packets: usize,
    pub window_ms: u64,
    /// Sources tracked at once; beyond this the limiter lets traffic through
    pub max_sources: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_packets: 10,
            window_ms: 1000,
            max_sources: 32,
        }
    }
}

#[derive(Debug, Clone)]
struct SourceWindow {
    source: u8,
    timestamps: Vec<u64>,
}

/// Sliding-window limiter keyed by source hash
#[derive(Debug)]
pub struct RateLimiter {
    sources: Vec<SourceWindow>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            sources: Vec::with_capacity(config.max_sources),
            config,
        }
    }

    /// True if the frame should be dropped
    ///
    /// Fails open when the source table is full.
    pub fn is_limited(&mut self, source: u8, now_ms: u64) -> bool {
        let window = self.config.window_ms;
        for entry in &mut self.sources {
            entry.timestamps.retain(|&t| now_ms.saturating_sub(t) < window);
        }
        self.sources.retain(|e| !e.timestamps.is_empty() || e.source == source);

        let idx = match self.sources.iter().position(|e| e.source == source) {
            Some(idx) => idx,
            None => {
                if self.sources.len() >= self.config.max_sources {
                    warn!("Rate limiter table full, passing {:02x}", source);
                    return false;
                }
                self.sources.push(SourceWindow {
                    source,
                    timestamps: Vec::with_capacity(self.config.max_packets),
                });
                self.sources.len() - 1
            }
        };

        let entry = &mut self.sources[idx];
        if entry.timestamps.len() >= self.config.max_packets {
            return true;
        }
        entry.timestamps.push(now_ms);
        false
    }

    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flood(path: &[u8]) -> Packet {
        let mut p = Packet::new(RouteType::Flood, PayloadType::GroupText, vec![0x11, 0x22, 0x33]);
        p.path = path.to_vec();
        p
    }

    #[test]
    fn test_should_forward() {
        let pkt = flood(&[0x01, 0x02]);
        assert!(should_forward(&pkt, 0x03, DeviceMode::Repeater));
        assert!(should_forward(&pkt, 0x03, DeviceMode::Room));
        assert!(!should_forward(&pkt, 0x03, DeviceMode::Client));
        // Loop: our hash already in the path
        assert!(!should_forward(&pkt, 0x02, DeviceMode::Repeater));

        let mut direct = pkt.clone();
        direct.header.route = RouteType::Direct;
        assert!(!should_forward(&direct, 0x03, DeviceMode::Repeater));

        let mut transport = pkt.clone();
        transport.header.route = RouteType::TransportFlood;
        assert!(should_forward(&transport, 0x03, DeviceMode::Repeater));
    }

    #[test]
    fn test_loop_freedom() {
        // Forward once, then the same frame coming back is refused
        let mut pkt = flood(&[]);
        for hop in [0x10u8, 0x20, 0x30] {
            assert!(should_forward(&pkt, hop, DeviceMode::Repeater));
            pkt.path_append(hop).unwrap();
        }
        for hop in [0x10u8, 0x20, 0x30] {
            assert!(!should_forward(&pkt, hop, DeviceMode::Repeater));
        }
    }

    #[test]
    fn test_retransmit_delay() {
        let pkt = flood(&[]);
        assert_eq!(retransmit_delay(&pkt, 0), 100 + 640);
        assert_eq!(retransmit_delay(&pkt, 255), 100 + 640 + 99);

        let far = flood(&[0u8; 60]);
        assert_eq!(retransmit_delay(&far, 128), 100 + 40 + 50);

        let full = flood(&[0u8; 64]);
        assert_eq!(retransmit_delay(&full, 0), 100);
        assert!(retransmit_delay(&pkt, 255) <= RETRANSMIT_MAX_MS);
    }

    #[test]
    fn test_forward_priority() {
        assert_eq!(forward_priority(&flood(&[])), 10);
        assert_eq!(forward_priority(&flood(&[1, 2, 3])), 7);
        assert_eq!(forward_priority(&flood(&[0; 9])), 1);
        assert_eq!(forward_priority(&flood(&[0; 40])), 1);
    }

    #[test]
    fn test_source_hash() {
        assert_eq!(source_hash(&flood(&[0x01, 0x7F])), 0x7F);
        // No path: second payload byte of a group text
        assert_eq!(source_hash(&flood(&[])), 0x22);

        let mut advert = Packet::new(RouteType::Direct, PayloadType::Advert, vec![0xAB; 40]);
        assert_eq!(source_hash(&advert), 0xAB);
        advert.payload.truncate(10);
        assert_eq!(source_hash(&advert), 0);

        let ack = Packet::new(RouteType::Direct, PayloadType::Ack, vec![1, 2, 3, 4]);
        assert_eq!(source_hash(&ack), 0);
    }

    #[test]
    fn test_duplicate_window() {
        let mut seen = SeenTable::default();
        assert!(!seen.check_and_insert(0x42, 1000));
        assert!(seen.check_and_insert(0x42, 1000 + 59_999));
        assert!(!seen.check_and_insert(0x42, 1000 + 60_000));
        assert!(!seen.check_and_insert(0x43, 1000));
    }

    #[test]
    fn test_zero_hash_not_duplicate_at_boot() {
        let mut seen = SeenTable::default();
        assert!(!seen.check_and_insert(0, 0));
        assert!(seen.check_and_insert(0, 10));
    }

    #[test]
    fn test_seen_ring_overwrites() {
        let mut seen = SeenTable::new(&DedupConfig { slots: 2, window_ms: 60_000 });
        assert!(!seen.check_and_insert(1, 0));
        assert!(!seen.check_and_insert(2, 0));
        assert!(!seen.check_and_insert(3, 0));
        // Slot of hash 1 was reused
        assert!(!seen.check_and_insert(1, 0));
    }

    #[test]
    fn test_rate_limit() {
        let mut limiter = RateLimiter::default();
        for i in 0..10 {
            assert!(!limiter.is_limited(0x55, i * 10));
        }
        assert!(limiter.is_limited(0x55, 100));
        // Other sources unaffected
        assert!(!limiter.is_limited(0x56, 100));
        // Window slides
        assert!(!limiter.is_limited(0x55, 1001));
    }

    #[test]
    fn test_rate_limit_fails_open() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            max_packets: 1,
            window_ms: 1000,
            max_sources: 2,
        });
        assert!(!limiter.is_limited(1, 0));
        assert!(!limiter.is_limited(2, 0));
        // Table full: unknown source passes every time
        assert!(!limiter.is_limited(3, 0));
        assert!(!limiter.is_limited(3, 0));
        assert!(limiter.is_limited(1, 0));
        // Old windows expire and free their slots
        assert!(!limiter.is_limited(3, 5000));
        assert!(limiter.is_limited(3, 5000));
    }
}
