//! Node context
//!
//! [`MeshNode`] owns every piece of protocol state and the four
//! collaborators (radio, clock, RNG, store). The host drives it with two
//! calls:
//!
//! - [`MeshNode::process_received_frame`] for each frame the radio hands up
//! - [`MeshNode::tick`] periodically, to drain the TX queue, fire beacons
//!   and prune the neighbor table
//!
//! ## Receive path
//!
//! ```text
//! bytes ─► decode ─► seen? ─► rate limit ─► v1 decode ─► dispatch by type ─► forward?
//!            │         │          │             │               │               │
//!          drop       dup       drop      event/return    event/return     TX queue
//! ```
//!
//! Everything that happens to a frame is counted in [`MeshStats`];
//! application-visible results are queued as [`MeshEvent`]s.

use crate::advert::{Advert, AdvertType, AppData, DiscoveryInfo, CAP_V1};
use crate::beacon::{BeaconConfig, BeaconKind, BeaconSchedule};
use crate::bloom::BloomFilter;
use crate::channel::ChannelTable;
use crate::crypto::{self, Identity};
use crate::error::{MeshError, MeshResult};
use crate::mac::{AirtimeConfig, TxOutcome, TxQueue};
use crate::neighbor::{
    NeighborChange, NeighborConfig, NeighborCounts, NeighborSnapshot, NeighborTable, Sighting,
};
use crate::packet::{Packet, PayloadType, RouteType, RxMetadata, MAX_PATH_SIZE, MAX_PAYLOAD_SIZE};
use crate::routing::{self, DedupConfig, DeviceMode, RateLimitConfig, RateLimiter, SeenTable};
use crate::session::{self, FallbackPolicy, Protocol, V1Direct};
use crate::store;
use crate::traits::{Clock, KvStore, Radio};
use crate::trickle::{Trickle, TrickleConfig};
use byteorder::{ByteOrder, LittleEndian};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Priority of frames this node originates
pub const LOCAL_PRIORITY: u8 = 1;
/// Priority of relayed trace frames
pub const TRACE_PRIORITY: u8 = 5;
/// How often stale neighbors are pruned
pub const PRUNE_INTERVAL_MS: u64 = 60_000;
/// Events kept for the application before the oldest is dropped
pub const MAX_EVENTS: usize = 64;

/// trace_id(4) auth(4) flags(1)
const TRACE_HEADER_SIZE: usize = 9;
/// trace_id(4) hops(1)
const PATH_HEADER_SIZE: usize = 5;
const TRACE_RTT_LIMIT_MS: u32 = 60_000;
const MAX_PENDING_TRACES: usize = 8;

/// Everything a node needs to know at boot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Advertised name (at most 16 bytes on air)
    pub name: String,
    pub mode: DeviceMode,
    /// Speak v1 to peers that advertise it
    pub v1_enabled: bool,
    /// What to do when v1 is wanted but fails
    pub policy: FallbackPolicy,
    /// Generation used for channel messages when v1 is enabled
    pub channel_protocol: Protocol,
    pub verify_advert_signatures: bool,
    pub airtime: AirtimeConfig,
    pub neighbors: NeighborConfig,
    pub dedup: DedupConfig,
    pub rate_limit: RateLimitConfig,
    pub trickle: TrickleConfig,
    pub beacon: BeaconConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "meshgrid".to_string(),
            mode: DeviceMode::Client,
            v1_enabled: true,
            policy: FallbackPolicy::Fallback,
            channel_protocol: Protocol::V0,
            verify_advert_signatures: true,
            airtime: AirtimeConfig::default(),
            neighbors: NeighborConfig::default(),
            dedup: DedupConfig::default(),
            rate_limit: RateLimitConfig::default(),
            trickle: TrickleConfig::default(),
            beacon: BeaconConfig::default(),
        }
    }
}

/// Node counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeshStats {
    pub rx: u64,
    pub tx: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub rate_limited: u64,
    pub auth_failures: u64,
    /// v1 messages whose sequence number was already seen
    pub replays: u64,
    pub queue_drops: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub neighbors: NeighborCounts,
}

/// Something the application should hear about
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MeshEvent {
    DirectMessage {
        /// Sender's 1-byte hash
        from: u8,
        text: String,
        timestamp: u32,
        protocol: Protocol,
        /// v1 sequence number
        seq: Option<u32>,
    },
    ChannelMessage {
        channel: String,
        channel_hash: u8,
        /// v1 sender hash; v0 senders name themselves in the text
        sender: Option<u16>,
        text: String,
        timestamp: u32,
        protocol: Protocol,
    },
    NeighborDiscovered {
        hash: u8,
        name: String,
    },
    NeighborLost {
        hash: u8,
        name: String,
    },
    TraceResult {
        trace_id: u32,
        hops: u8,
        /// Per-hop SNR in quarter dB
        snrs: Vec<i8>,
        rtt_ms: Option<u32>,
    },
}

/// What the dispatcher decided for a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Handled here, not relayed
    Consumed,
    /// Rejected and counted as dropped
    Dropped,
    /// Eligible for re-broadcast, limited to `ttl` hops when set
    Relay(Option<u8>),
}

/// One mesh node and its collaborators
pub struct MeshNode<R: Radio, C: Clock, G: RngCore, S: KvStore> {
    config: NodeConfig,
    identity: Identity,
    radio: R,
    clock: C,
    rng: G,
    store: S,
    neighbors: NeighborTable,
    channels: ChannelTable,
    seen: SeenTable,
    limiter: RateLimiter,
    tx: TxQueue,
    trickle: Trickle,
    beacons: BeaconSchedule,
    bloom: BloomFilter,
    stats: MeshStats,
    events: VecDeque<MeshEvent>,
    pending_traces: VecDeque<u32>,
    added_since_save: u32,
    next_prune_ms: u64,
    started: bool,
}

impl<R: Radio, C: Clock, G: RngCore, S: KvStore> std::fmt::Debug for MeshNode<R, C, G, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("name", &self.config.name)
            .field("hash", &format_args!("{:02x}", self.identity.hash()))
            .field("mode", &self.config.mode)
            .field("neighbors", &self.neighbors.len())
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl<R: Radio, C: Clock, G: RngCore, S: KvStore> MeshNode<R, C, G, S> {
    pub fn new(config: NodeConfig, identity: Identity, radio: R, clock: C, rng: G, store: S) -> Self {
        let now = clock.now_ms();
        Self {
            neighbors: NeighborTable::new(config.neighbors.clone()),
            channels: ChannelTable::new(),
            seen: SeenTable::new(&config.dedup),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            tx: TxQueue::new(config.airtime.clone()),
            trickle: Trickle::new(&config.trickle),
            beacons: BeaconSchedule::new(config.beacon.clone(), now),
            bloom: BloomFilter::new(),
            stats: MeshStats::default(),
            events: VecDeque::new(),
            pending_traces: VecDeque::new(),
            added_since_save: 0,
            next_prune_ms: now + PRUNE_INTERVAL_MS,
            started: false,
            config,
            identity,
            radio,
            clock,
            rng,
            store,
        }
    }

    /// Restore persisted state, arm the beacon timers and flood an advert
    pub fn start(&mut self) -> MeshResult<()> {
        let now = self.clock.now_ms();

        if let Some(saved) = store::load_neighbors(&self.store) {
            let restored = self.neighbors.restore(&self.identity, &saved, now);
            info!("Restored {} neighbors", restored);
        }
        let channels = store::load_channels(&self.store);
        if !channels.is_empty() {
            let restored = self.channels.restore(&channels);
            info!("Restored {} channels", restored);
        }
        self.rebuild_bloom();

        self.beacons = BeaconSchedule::new(self.config.beacon.clone(), now);
        if self.config.beacon.adaptive {
            self.trickle.start(now, &mut self.rng);
        }
        self.next_prune_ms = now + PRUNE_INTERVAL_MS;
        self.started = true;

        info!(
            "Node {:02x} {:?} started ({:?}, v1 {})",
            self.identity.hash(),
            self.config.name,
            self.config.mode,
            if self.config.v1_enabled { "on" } else { "off" }
        );
        self.send_beacon(BeaconKind::FloodAdvert)
    }

    /// Periodic work: one TX attempt, beacons, pruning
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();

        if let TxOutcome::Sent { len, .. } = self.tx.process(&mut self.radio, now) {
            self.stats.tx += 1;
            self.stats.bytes_tx += len as u64;
        }

        if !self.started {
            return;
        }
        self.run_beacons(now);

        if now >= self.next_prune_ms {
            self.next_prune_ms = now + PRUNE_INTERVAL_MS;
            self.prune(now);
        }
    }

    // ---- Receive path ----

    /// Handle one frame from the radio
    ///
    /// Never fails: whatever goes wrong is counted in [`MeshStats`].
    pub fn process_received_frame(&mut self, frame: &[u8], rssi: i16, snr: f32) {
        let now = self.clock.now_ms();

        let mut packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("DROP {}B frame: {}", frame.len(), e);
                self.stats.dropped += 1;
                return;
            }
        };
        packet.rx = Some(RxMetadata {
            rssi,
            snr,
            rx_time_ms: now,
        });
        self.stats.rx += 1;
        self.stats.bytes_rx += frame.len() as u64;

        if self.seen.check_and_insert(packet.hash(), now) {
            debug!("DUP {} hash={:02x}", packet.payload_type(), packet.hash());
            self.stats.duplicates += 1;
            return;
        }

        let source = routing::source_hash(&packet);
        if packet.payload_type() != PayloadType::Ack
            && source != 0
            && self.limiter.is_limited(source, now)
        {
            warn!("Rate limiting {:02x}, dropping {}", source, packet.payload_type());
            self.stats.rate_limited += 1;
            self.stats.dropped += 1;
            return;
        }

        match self.dispatch(&mut packet, now) {
            Disposition::Consumed => {}
            Disposition::Dropped => self.stats.dropped += 1,
            Disposition::Relay(ttl) => self.forward(packet, ttl),
        }
    }

    fn dispatch(&mut self, packet: &mut Packet, now: u64) -> Disposition {
        let payload_type = packet.payload_type();

        if packet.version() >= 1 {
            let handled = match payload_type {
                PayloadType::TextMessage => self.handle_v1_direct(packet),
                PayloadType::GroupText => self.handle_v1_group(packet),
                _ => None,
            };
            if let Some(disposition) = handled {
                return disposition;
            }
            if self.config.policy == FallbackPolicy::Strict
                && matches!(payload_type, PayloadType::TextMessage | PayloadType::GroupText)
            {
                return Disposition::Relay(None);
            }
        }

        match payload_type {
            PayloadType::Advert => self.handle_advert(packet, now),
            PayloadType::Ack => Disposition::Consumed,
            PayloadType::Trace => self.handle_trace(packet, now),
            PayloadType::Path => self.handle_path(packet, now),
            PayloadType::TextMessage => self.handle_v0_direct(packet),
            PayloadType::GroupText => self.handle_v0_group(packet),
            _ => Disposition::Relay(None),
        }
    }

    fn handle_advert(&mut self, packet: &Packet, now: u64) -> Disposition {
        let advert = match Advert::parse(&packet.payload, packet.version()) {
            Ok(advert) => advert,
            Err(e) => {
                debug!("DROP advert: {}", e);
                return Disposition::Dropped;
            }
        };
        if &advert.public_key == self.identity.public_key() {
            return Disposition::Consumed;
        }
        if self.config.verify_advert_signatures && !advert.verify() {
            debug!("DROP advert from {:02x}: bad signature", advert.hash());
            self.stats.auth_failures += 1;
            return Disposition::Dropped;
        }

        let hops = packet.path_len().min(u8::MAX as usize) as u8;
        let (rssi, snr) = packet.rx.as_ref().map_or((0, 0.0), |m| (m.rssi, m.snr));
        let sighting = Sighting {
            public_key: &advert.public_key,
            name: advert.app_data.name.as_deref().unwrap_or(""),
            adv_type: advert.app_data.adv_type,
            timestamp: advert.timestamp,
            rssi,
            snr,
            hops,
            protocol_version: packet.version().max(u8::from(advert.app_data.supports_v1())),
        };

        match self.neighbors.update(&self.identity, &sighting, now) {
            NeighborChange::Added { evicted } => {
                if let Some(old) = evicted {
                    self.push_event(MeshEvent::NeighborLost {
                        hash: old.hash,
                        name: old.name,
                    });
                }
                let name = self
                    .neighbors
                    .get(&advert.public_key)
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                self.push_event(MeshEvent::NeighborDiscovered {
                    hash: advert.hash(),
                    name,
                });
                self.trickle.reset(now, &mut self.rng);

                self.added_since_save += 1;
                if self.added_since_save >= self.config.neighbors.save_every {
                    self.save_neighbors();
                }
            }
            NeighborChange::Renamed => {}
            NeighborChange::Refreshed => self.trickle.heard_beacon(true),
        }

        if hops == 0 {
            self.bloom.add(0, crypto::v1_hash(&advert.public_key));
        }
        match &advert.app_data.discovery {
            Some(info) => {
                if hops == 0 {
                    self.bloom.merge(&info.bloom);
                }
                Disposition::Relay(Some(info.ttl))
            }
            None => Disposition::Relay(None),
        }
    }

    fn handle_v0_direct(&mut self, packet: &Packet) -> Disposition {
        let Some((dest, src)) = session::v0_direct_addresses(&packet.payload) else {
            return Disposition::Dropped;
        };
        if dest != self.identity.hash() {
            return Disposition::Relay(None);
        }

        let decoded = self
            .neighbors
            .iter()
            .filter(|n| n.hash == src)
            .find_map(|peer| session::decode_v0_direct(peer.secret()?, &packet.payload).ok());

        match decoded {
            Some(message) => {
                debug!("TXT_MSG from {:02x}: {} bytes", src, message.text.len());
                self.push_event(MeshEvent::DirectMessage {
                    from: src,
                    text: message.text,
                    timestamp: message.timestamp,
                    protocol: Protocol::V0,
                    seq: None,
                });
                Disposition::Consumed
            }
            None => {
                // May belong to another node sharing our hash
                debug!("TXT_MSG for {:02x} from {:02x} did not authenticate", dest, src);
                self.stats.auth_failures += 1;
                Disposition::Relay(None)
            }
        }
    }

    fn handle_v0_group(&mut self, packet: &Packet) -> Disposition {
        let Some(&hash) = packet.payload.first() else {
            return Disposition::Dropped;
        };
        let decoded = self.channels.candidates(hash).find_map(|channel| {
            session::decode_v0_group(channel.secret(), &packet.payload)
                .ok()
                .map(|m| (channel.name().to_string(), m))
        });
        if let Some((channel, message)) = decoded {
            self.push_event(MeshEvent::ChannelMessage {
                channel,
                channel_hash: hash,
                sender: None,
                text: message.text,
                timestamp: message.timestamp,
                protocol: Protocol::V0,
            });
        }
        Disposition::Relay(None)
    }

    /// `None` when no v1-capable neighbor's key opens the payload
    fn handle_v1_direct(&mut self, packet: &Packet) -> Option<Disposition> {
        if packet.payload.len() < session::V1_MIN_PAYLOAD {
            return None;
        }
        let ours = self.identity.v1_hash();
        let (from, accepted, message) = self
            .neighbors
            .iter_mut()
            .filter(|n| n.supports_v1())
            .find_map(|peer| {
                let message = session::decode_v1_direct(peer.secret()?, &packet.payload).ok()?;
                let accepted = message.dest == ours && peer.verify_seq_rx(message.seq);
                Some((peer.hash, accepted, message))
            })?;

        if message.dest != ours {
            return Some(Disposition::Consumed);
        }
        if !accepted {
            debug!("DROP from {:02x}: {}", from, MeshError::Replay(message.seq));
            self.stats.replays += 1;
            return Some(Disposition::Dropped);
        }

        self.push_event(MeshEvent::DirectMessage {
            from,
            text: message.text,
            timestamp: message.timestamp,
            protocol: Protocol::V1,
            seq: Some(message.seq),
        });
        Some(Disposition::Consumed)
    }

    fn handle_v1_group(&mut self, packet: &Packet) -> Option<Disposition> {
        if packet.payload.len() < session::V1_MIN_PAYLOAD {
            return None;
        }
        let (channel, message) = self.channels.iter().find_map(|channel| {
            let message = session::decode_v1_group(channel.secret(), &packet.payload).ok()?;
            (message.channel_hash == channel.hash()).then(|| (channel.name().to_string(), message))
        })?;

        if message.src != Some(self.identity.v1_hash()) {
            self.push_event(MeshEvent::ChannelMessage {
                channel,
                channel_hash: message.channel_hash,
                sender: message.src,
                text: message.text,
                timestamp: message.timestamp,
                protocol: Protocol::V1,
            });
        }
        Some(Disposition::Relay(None))
    }

    fn handle_trace(&mut self, packet: &mut Packet, now: u64) -> Disposition {
        if packet.route() != RouteType::Direct || packet.path_len() >= MAX_PATH_SIZE {
            return Disposition::Consumed;
        }
        if packet.payload.len() < TRACE_HEADER_SIZE {
            return Disposition::Dropped;
        }

        let trace_id = LittleEndian::read_u32(&packet.payload[..4]);
        let hash_shift = packet.payload[8] & 0x03;
        let route = &packet.payload[TRACE_HEADER_SIZE..];
        let offset = packet.path_len() << hash_shift;
        let next_hop = route.get(offset).copied();
        let snr = quarter_db(packet.rx.as_ref().map_or(0.0, |m| m.snr));

        let Some(next_hop) = next_hop else {
            return self.finish_trace(packet, trace_id, snr, now);
        };
        if next_hop != self.identity.hash() {
            return Disposition::Consumed;
        }

        if let Err(e) = packet.path_append(snr as u8) {
            debug!("DROP TRACE {:08x}: {}", trace_id, e);
            return Disposition::Dropped;
        }
        match packet.to_bytes() {
            Ok(frame) => {
                if self.enqueue_for_send(frame, 0, TRACE_PRIORITY).is_ok() {
                    debug!("TRACE {:08x} fwd (hop {})", trace_id, packet.path_len());
                    self.stats.forwarded += 1;
                }
            }
            Err(e) => debug!("DROP TRACE {:08x}: {}", trace_id, e),
        }
        Disposition::Consumed
    }

    /// A trace that has walked its whole route
    fn finish_trace(&mut self, packet: &Packet, trace_id: u32, snr: i8, now: u64) -> Disposition {
        let hops = packet.path_len() as u8;

        if self.take_pending_trace(trace_id) {
            let mut snrs: Vec<i8> = packet.path.iter().map(|&b| b as i8).collect();
            snrs.push(snr);
            self.push_event(MeshEvent::TraceResult {
                trace_id,
                hops,
                snrs,
                rtt_ms: trace_rtt(now, trace_id),
            });
            return Disposition::Consumed;
        }

        let mut reply = Vec::with_capacity(PATH_HEADER_SIZE + packet.path_len() + 1);
        reply.extend_from_slice(&trace_id.to_le_bytes());
        reply.push(hops);
        reply.extend_from_slice(&packet.path);
        reply.push(snr as u8);

        debug!("TRACE {:08x} reached end after {} hops", trace_id, hops);
        if let Err(e) = self.send_local(Packet::new(RouteType::Flood, PayloadType::Path, reply)) {
            debug!("TRACE {:08x} reply not queued: {}", trace_id, e);
        }
        Disposition::Consumed
    }

    fn handle_path(&mut self, packet: &Packet, now: u64) -> Disposition {
        if packet.payload.len() < PATH_HEADER_SIZE {
            return Disposition::Dropped;
        }
        let trace_id = LittleEndian::read_u32(&packet.payload[..4]);
        if !self.take_pending_trace(trace_id) {
            return Disposition::Relay(None);
        }

        self.push_event(MeshEvent::TraceResult {
            trace_id,
            hops: packet.payload[4],
            snrs: packet.payload[PATH_HEADER_SIZE..].iter().map(|&b| b as i8).collect(),
            rtt_ms: trace_rtt(now, trace_id),
        });
        Disposition::Consumed
    }

    fn forward(&mut self, mut packet: Packet, ttl: Option<u8>) {
        let ours = self.identity.hash();
        if !routing::should_forward(&packet, ours, self.config.mode) {
            return;
        }
        if let Some(ttl) = ttl {
            if packet.path_len() >= ttl as usize {
                debug!("TTL {} reached, not relaying {}", ttl, packet.payload_type());
                return;
            }
        }
        if let Err(e) = packet.path_append(ours) {
            debug!("DROP {}: {}", packet.payload_type(), e);
            self.stats.dropped += 1;
            return;
        }

        let delay = routing::retransmit_delay(&packet, self.rng.gen());
        let priority = routing::forward_priority(&packet);
        let frame = match packet.to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("DROP {}: {}", packet.payload_type(), e);
                self.stats.dropped += 1;
                return;
            }
        };
        if self.enqueue_for_send(frame, delay, priority).is_ok() {
            debug!("FWD {} hops={} delay={}ms", packet.payload_type(), packet.path_len(), delay);
            self.stats.forwarded += 1;
        }
    }

    // ---- Transmit path ----

    /// Queue an encoded frame
    pub fn enqueue_for_send(&mut self, frame: Vec<u8>, delay_ms: u64, priority: u8) -> MeshResult<()> {
        let now = self.clock.now_ms();
        let result = self.tx.enqueue(frame, delay_ms, priority, now);
        if result.is_err() {
            self.stats.queue_drops += 1;
        }
        result
    }

    /// Queue a frame we originate; its echoes are treated as duplicates
    fn send_local(&mut self, packet: Packet) -> MeshResult<()> {
        let now = self.clock.now_ms();
        let frame = packet.to_bytes()?;
        self.seen.check_and_insert(packet.hash(), now);
        self.enqueue_for_send(frame, 0, LOCAL_PRIORITY)
    }

    /// Send a direct message, returning the generation used
    pub fn send_text(&mut self, dest: u8, text: &str) -> MeshResult<Protocol> {
        let peer = self
            .neighbors
            .iter()
            .find(|n| n.hash == dest && n.secret_valid())
            .or_else(|| self.neighbors.find(dest))
            .ok_or(MeshError::UnknownNeighbor(dest))?;
        if !peer.secret_valid() {
            return Err(MeshError::NoSharedSecret(dest));
        }
        let public_key = peer.public_key;

        if session::select_protocol(peer, self.config.v1_enabled) == Protocol::V1 {
            match self.send_v1_text(&public_key, text) {
                Ok(()) => return Ok(Protocol::V1),
                Err(e) if self.config.policy == FallbackPolicy::Strict => return Err(e),
                Err(MeshError::QueueFull) => return Err(MeshError::QueueFull),
                Err(e) => warn!("v1 send to {:02x} failed ({}), falling back to v0", dest, e),
            }
        }
        self.send_v0_text(&public_key, text)?;
        Ok(Protocol::V0)
    }

    fn send_v1_text(&mut self, public_key: &[u8; crypto::PUBKEY_SIZE], text: &str) -> MeshResult<()> {
        if text.len() > session::max_v1_direct_text() {
            return Err(MeshError::MessageTooLong(text.len()));
        }
        let now = self.clock.now_ms();
        let timestamp = self.clock.unix_time();
        let src = self.identity.v1_hash();

        let peer = self
            .neighbors
            .get_mut(public_key)
            .ok_or(MeshError::UnknownNeighbor(public_key[0]))?;
        let secret = peer.secret().cloned().ok_or(MeshError::NoSharedSecret(peer.hash))?;
        let route = if peer.hops == 0 { RouteType::Direct } else { RouteType::Flood };
        let message = V1Direct {
            dest: peer.v1_hash,
            src,
            seq: peer.next_seq_tx.max(1),
            timestamp,
            text: text.to_string(),
        };

        let nonce = crypto::v1_nonce(now, &mut self.rng);
        let payload = session::encode_v1_direct(&secret, &nonce, &message)?;
        debug!("TXT_MSG v1 to {:04x} seq={} via {:?}", message.dest, message.seq, route);
        self.send_local(Packet::new(route, PayloadType::TextMessage, payload).with_version(1))?;

        // Only a queued frame consumes its sequence number
        if let Some(peer) = self.neighbors.get_mut(public_key) {
            peer.take_seq_tx();
        }
        Ok(())
    }

    fn send_v0_text(&mut self, public_key: &[u8; crypto::PUBKEY_SIZE], text: &str) -> MeshResult<()> {
        let timestamp = self.clock.unix_time();
        let peer = self
            .neighbors
            .get(public_key)
            .ok_or(MeshError::UnknownNeighbor(public_key[0]))?;
        let secret = peer.secret().ok_or(MeshError::NoSharedSecret(peer.hash))?;
        let route = if peer.hops == 0 { RouteType::Direct } else { RouteType::Flood };
        let payload =
            session::encode_v0_direct(secret, peer.hash, self.identity.hash(), timestamp, text)?;
        debug!("TXT_MSG v0 to {:02x} via {:?}", peer.hash, route);
        self.send_local(Packet::new(route, PayloadType::TextMessage, payload))
    }

    /// Send to a channel by name
    pub fn send_channel(&mut self, name: &str, text: &str) -> MeshResult<Protocol> {
        let now = self.clock.now_ms();
        let timestamp = self.clock.unix_time();
        let protocol = if self.config.v1_enabled {
            self.config.channel_protocol
        } else {
            Protocol::V0
        };
        let channel = self
            .channels
            .get(name)
            .ok_or_else(|| MeshError::UnknownChannel(name.to_string()))?;

        let packet = match protocol {
            Protocol::V0 => {
                let payload = session::encode_v0_group(
                    channel.secret(),
                    channel.hash(),
                    timestamp,
                    &self.config.name,
                    text,
                )?;
                Packet::new(RouteType::Flood, PayloadType::GroupText, payload)
            }
            Protocol::V1 => {
                let nonce = crypto::v1_nonce(now, &mut self.rng);
                let payload = session::encode_v1_group(
                    channel.secret(),
                    &nonce,
                    channel.hash(),
                    self.identity.v1_hash(),
                    timestamp,
                    text,
                )?;
                Packet::new(RouteType::Flood, PayloadType::GroupText, payload).with_version(1)
            }
        };
        self.send_local(packet)?;
        Ok(protocol)
    }

    /// Start a trace along `route` (hop hashes, target last)
    pub fn trace(&mut self, route: &[u8]) -> MeshResult<u32> {
        if route.is_empty() || TRACE_HEADER_SIZE + route.len() > MAX_PAYLOAD_SIZE {
            return Err(MeshError::MessageTooLong(route.len()));
        }
        let now = self.clock.now_ms();
        let trace_id = now as u32;

        let mut payload = Vec::with_capacity(TRACE_HEADER_SIZE + route.len());
        payload.extend_from_slice(&trace_id.to_le_bytes());
        payload.extend_from_slice(&((now / 1000) as u32).to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(route);
        let frame = Packet::new(RouteType::Direct, PayloadType::Trace, payload).to_bytes()?;

        // Not marked seen: the trace comes back to us at the end of its route
        self.enqueue_for_send(frame, 0, LOCAL_PRIORITY)?;
        if self.pending_traces.len() >= MAX_PENDING_TRACES {
            self.pending_traces.pop_front();
        }
        self.pending_traces.push_back(trace_id);
        info!("TRACE {:08x} via {} hops", trace_id, route.len());
        Ok(trace_id)
    }

    fn take_pending_trace(&mut self, trace_id: u32) -> bool {
        match self.pending_traces.iter().position(|&id| id == trace_id) {
            Some(pos) => {
                self.pending_traces.remove(pos);
                true
            }
            None => false,
        }
    }

    // ---- Beacons ----

    /// Advertise now; `flood` selects a network-wide advert over a zero-hop one
    pub fn send_advertisement(&mut self, flood: bool) -> MeshResult<()> {
        self.send_beacon(if flood {
            BeaconKind::FloodAdvert
        } else {
            BeaconKind::Local
        })
    }

    /// Send a discovery beacon on the next tick
    pub fn trigger_discovery(&mut self) {
        self.beacons.trigger_discovery();
    }

    pub fn send_beacon(&mut self, kind: BeaconKind) -> MeshResult<()> {
        let packet = match kind {
            BeaconKind::Local => self.advert_packet(RouteType::Direct, None),
            BeaconKind::FloodAdvert => self.advert_packet(RouteType::Flood, None),
            BeaconKind::Discovery => {
                let mut bloom = self.bloom;
                bloom.attenuate(self.identity.v1_hash());
                let info = DiscoveryInfo {
                    ttl: self.config.beacon.discovery_ttl,
                    bloom,
                };
                self.advert_packet(RouteType::Flood, Some(info))
            }
        };
        debug!("BEACON {:?} {}B", kind, packet.encoded_len());
        self.send_local(packet)
    }

    fn advert_packet(&self, route: RouteType, discovery: Option<DiscoveryInfo>) -> Packet {
        let mut app_data = AppData::named(&self.config.name);
        app_data.adv_type = match self.config.mode {
            DeviceMode::Client => AdvertType::Chat,
            DeviceMode::Repeater => AdvertType::Repeater,
            DeviceMode::Room => AdvertType::Room,
        };
        if self.config.v1_enabled {
            app_data.feat2 = Some(CAP_V1);
        }
        let version = u8::from(discovery.is_some());
        app_data.discovery = discovery;

        let advert = Advert::signed(&self.identity, self.clock.unix_time(), app_data);
        Packet::new(route, PayloadType::Advert, advert.to_payload()).with_version(version)
    }

    fn run_beacons(&mut self, now: u64) {
        let mut due = Vec::new();

        if self.config.beacon.adaptive {
            self.trickle.update(now, &mut self.rng);
            if self.trickle.should_beacon(now) {
                self.trickle.beacon_sent();
                due.push(BeaconKind::Local);
            }
        } else if self.beacons.should_send_local(now) {
            self.beacons.local_sent(now);
            due.push(BeaconKind::Local);
        }

        if self.config.v1_enabled && self.beacons.should_send_discovery(now) {
            self.beacons.discovery_sent(now);
            due.push(BeaconKind::Discovery);
        }
        if self.beacons.should_send_flood_advert(now) {
            self.beacons.flood_advert_sent(now);
            due.push(BeaconKind::FloodAdvert);
        }

        for kind in due {
            if let Err(e) = self.send_beacon(kind) {
                warn!("{:?} beacon not sent: {}", kind, e);
            }
        }
    }

    // ---- Neighbors & persistence ----

    fn prune(&mut self, now: u64) {
        let lost = self.neighbors.prune(now);
        if lost.is_empty() {
            return;
        }
        for n in lost {
            self.push_event(MeshEvent::NeighborLost {
                hash: n.hash,
                name: n.name,
            });
        }
        self.rebuild_bloom();
        self.trickle.reset(now, &mut self.rng);
    }

    /// Level 0 holds the direct neighbors; deeper levels refill from beacons
    fn rebuild_bloom(&mut self) {
        self.bloom.clear();
        for n in self.neighbors.iter().filter(|n| n.hops == 0) {
            self.bloom.add(0, n.v1_hash);
        }
    }

    fn save_neighbors(&mut self) {
        self.added_since_save = 0;
        if let Err(e) = store::save_neighbors(&mut self.store, &self.neighbors.to_store()) {
            warn!("Failed to save neighbors: {}", e);
        }
    }

    /// Persist neighbors and channels now
    ///
    /// Receive watermarks are otherwise written only every
    /// `NeighborConfig::save_every` discoveries; hosts call this before a
    /// planned shutdown so a restart does not reopen the replay window.
    pub fn save_state(&mut self) -> MeshResult<()> {
        self.added_since_save = 0;
        store::save_neighbors(&mut self.store, &self.neighbors.to_store())?;
        store::save_channels(&mut self.store, &self.channels.to_records())
    }

    /// Add or replace a channel and persist the channel list
    pub fn add_channel(&mut self, name: &str, psk: &[u8]) -> MeshResult<u8> {
        let hash = self.channels.add(name, psk)?;
        store::save_channels(&mut self.store, &self.channels.to_records())?;
        Ok(hash)
    }

    pub fn remove_channel(&mut self, name: &str) -> MeshResult<bool> {
        let removed = self.channels.remove(name);
        if removed {
            store::save_channels(&mut self.store, &self.channels.to_records())?;
        }
        Ok(removed)
    }

    // ---- Events & accessors ----

    fn push_event(&mut self, event: MeshEvent) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
            debug!("Event queue full, dropped oldest");
        }
        self.events.push_back(event);
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.events.drain(..).collect()
    }

    pub fn neighbor_snapshot(&self) -> Vec<NeighborSnapshot> {
        self.neighbors.snapshot()
    }

    pub fn stats(&self) -> MeshStats {
        MeshStats {
            neighbors: self.neighbors.counts(),
            ..self.stats.clone()
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn hash(&self) -> u8 {
        self.identity.hash()
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    pub fn trickle(&self) -> &Trickle {
        &self.trickle
    }

    pub fn tx_queue(&self) -> &TxQueue {
        &self.tx
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

/// SNR as carried in trace paths
fn quarter_db(snr: f32) -> i8 {
    (snr * 4.0) as i8
}

/// Round trip for trace ids minted from our own clock
fn trace_rtt(now_ms: u64, trace_id: u32) -> Option<u32> {
    let rtt = (now_ms as u32).wrapping_sub(trace_id);
    (rtt < TRACE_RTT_LIMIT_MS).then_some(rtt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimRadio;
    use crate::store::MemoryStore;
    use crate::traits::ManualClock;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestNode = MeshNode<SimRadio, ManualClock, StdRng, MemoryStore>;

    fn node(seed: u8, name: &str, mode: DeviceMode, clock: &ManualClock) -> TestNode {
        let config = NodeConfig {
            name: name.to_string(),
            mode,
            ..NodeConfig::default()
        };
        let identity = Identity::from_seed(&[seed; 32]);
        MeshNode::new(
            config,
            identity,
            SimRadio::new(),
            clock.clone(),
            StdRng::seed_from_u64(seed as u64),
            MemoryStore::new(),
        )
    }

    /// Tick until the queue drains, returning what went on air
    fn flush(node: &mut TestNode, clock: &ManualClock) -> Vec<Vec<u8>> {
        for _ in 0..20 {
            if node.tx_queue().is_empty() {
                break;
            }
            clock.advance(5_000);
            node.tick();
        }
        node.radio_mut().take_sent()
    }

    fn introduce(a: &mut TestNode, b: &mut TestNode, clock: &ManualClock) {
        a.send_advertisement(false).unwrap();
        for frame in flush(a, clock) {
            b.process_received_frame(&frame, -60, 8.0);
        }
        b.send_advertisement(false).unwrap();
        for frame in flush(b, clock) {
            a.process_received_frame(&frame, -60, 8.0);
        }
    }

    #[test]
    fn test_advert_creates_neighbor() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);

        a.send_advertisement(false).unwrap();
        let frames = flush(&mut a, &clock);
        assert_eq!(frames.len(), 1);
        b.process_received_frame(&frames[0], -70, 6.5);

        let peer = b.neighbors().find(a.hash()).unwrap();
        assert_eq!(peer.hash, a.identity().public_key()[0]);
        assert!(peer.secret_valid());
        assert_eq!(peer.next_seq_tx, 1);
        assert_eq!(peer.hops, 0);
        assert_eq!(peer.protocol_version, 1);
        assert_eq!(peer.name, "alice");

        let events = b.drain_events();
        assert!(events.contains(&MeshEvent::NeighborDiscovered {
            hash: a.hash(),
            name: "alice".into()
        }));
        assert_eq!(b.stats().neighbors.clients, 1);
    }

    #[test]
    fn test_v1_direct_message_and_replay() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        introduce(&mut a, &mut b, &clock);

        let sent_at = clock.unix_time();
        assert_eq!(a.send_text(b.hash(), "hello bob").unwrap(), Protocol::V1);
        let frames = flush(&mut a, &clock);
        assert_eq!(frames.len(), 1);
        let packet = Packet::decode(&frames[0]).unwrap();
        assert_eq!(packet.version(), 1);
        assert_eq!(packet.route(), RouteType::Direct);

        b.process_received_frame(&frames[0], -60, 8.0);
        let events = b.drain_events();
        assert_eq!(
            events,
            vec![MeshEvent::DirectMessage {
                from: a.hash(),
                text: "hello bob".into(),
                timestamp: sent_at,
                protocol: Protocol::V1,
                seq: Some(1),
            }]
        );

        // Same sequence number under a fresh nonce
        let secret = b.neighbors().find(a.hash()).unwrap().secret().unwrap().clone();
        let replay = V1Direct {
            dest: b.identity().v1_hash(),
            src: a.identity().v1_hash(),
            seq: 1,
            timestamp: clock.unix_time(),
            text: "hello again".into(),
        };
        let payload = session::encode_v1_direct(&secret, &[0xC3; 12], &replay).unwrap();
        let frame = Packet::new(RouteType::Direct, PayloadType::TextMessage, payload)
            .with_version(1)
            .to_bytes()
            .unwrap();
        b.process_received_frame(&frame, -60, 8.0);
        assert!(b.drain_events().is_empty());
        assert_eq!(b.stats().replays, 1);
        assert_eq!(b.stats().auth_failures, 0);
    }

    #[test]
    fn test_v0_direct_to_legacy_peer() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        b.config.v1_enabled = false;
        introduce(&mut a, &mut b, &clock);

        assert_eq!(a.neighbors().find(b.hash()).unwrap().protocol_version, 0);
        assert_eq!(a.send_text(b.hash(), "plain").unwrap(), Protocol::V0);
        for frame in flush(&mut a, &clock) {
            b.process_received_frame(&frame, -60, 8.0);
        }
        match b.drain_events().as_slice() {
            [MeshEvent::DirectMessage { from, text, protocol, seq, .. }] => {
                assert_eq!(*from, a.hash());
                assert_eq!(text, "plain");
                assert_eq!(*protocol, Protocol::V0);
                assert_eq!(*seq, None);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_fallback_policy() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        introduce(&mut a, &mut b, &clock);

        // Fits v0 but not v1
        let text = "x".repeat(session::max_v1_direct_text() + 1);
        assert_eq!(a.send_text(b.hash(), &text).unwrap(), Protocol::V0);

        a.config.policy = FallbackPolicy::Strict;
        assert!(matches!(
            a.send_text(b.hash(), &text),
            Err(MeshError::MessageTooLong(_))
        ));
    }

    #[test]
    fn test_send_to_unknown_neighbor() {
        let clock = ManualClock::new(0);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        assert!(matches!(
            a.send_text(0x42, "hi"),
            Err(MeshError::UnknownNeighbor(0x42))
        ));
        assert!(matches!(
            a.send_channel("nope", "hi"),
            Err(MeshError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_public_channel_message() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);

        assert_eq!(a.send_channel("Public", "hi all").unwrap(), Protocol::V0);
        for frame in flush(&mut a, &clock) {
            b.process_received_frame(&frame, -60, 8.0);
        }
        match b.drain_events().as_slice() {
            [MeshEvent::ChannelMessage { channel, text, sender, .. }] => {
                assert_eq!(channel, "Public");
                assert_eq!(text, "alice: hi all");
                assert_eq!(*sender, None);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_v1_channel_message() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        a.config.channel_protocol = Protocol::V1;
        a.add_channel("ops", &[0x11; 32]).unwrap();
        b.add_channel("ops", &[0x11; 32]).unwrap();

        assert_eq!(a.send_channel("ops", "sealed").unwrap(), Protocol::V1);
        for frame in flush(&mut a, &clock) {
            b.process_received_frame(&frame, -60, 8.0);
        }
        match b.drain_events().as_slice() {
            [MeshEvent::ChannelMessage { channel, text, sender, protocol, .. }] => {
                assert_eq!(channel, "ops");
                assert_eq!(text, "sealed");
                assert_eq!(*sender, Some(a.identity().v1_hash()));
                assert_eq!(*protocol, Protocol::V1);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_malformed_and_duplicate_frames() {
        let clock = ManualClock::new(0);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);

        b.process_received_frame(&[], 0, 0.0);
        b.process_received_frame(&[0x05, 200, 1, 2], 0, 0.0);
        assert_eq!(b.stats().dropped, 2);
        assert_eq!(b.stats().rx, 0);

        let frame = Packet::new(RouteType::Flood, PayloadType::RawCustom, vec![1, 2, 3])
            .to_bytes()
            .unwrap();
        b.process_received_frame(&frame, 0, 0.0);
        b.process_received_frame(&frame, 0, 0.0);
        let stats = b.stats();
        assert_eq!(stats.rx, 2);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_repeater_forwards_flood() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut r = node(3, "relay", DeviceMode::Repeater, &clock);
        let mut c = node(4, "carol", DeviceMode::Client, &clock);

        a.send_advertisement(true).unwrap();
        let frames = flush(&mut a, &clock);

        c.process_received_frame(&frames[0], -60, 8.0);
        assert!(c.tx_queue().is_empty());
        assert_eq!(c.stats().forwarded, 0);

        r.process_received_frame(&frames[0], -60, 8.0);
        assert_eq!(r.stats().forwarded, 1);
        let relayed = flush(&mut r, &clock);
        assert_eq!(relayed.len(), 1);
        let packet = Packet::decode(&relayed[0]).unwrap();
        assert_eq!(packet.path, vec![r.hash()]);

        // The relay ignores its own echo
        r.process_received_frame(&relayed[0], -60, 8.0);
        assert_eq!(r.stats().duplicates, 1);
    }

    #[test]
    fn test_zero_hop_advert_not_forwarded() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut r = node(3, "relay", DeviceMode::Repeater, &clock);

        a.send_advertisement(false).unwrap();
        for frame in flush(&mut a, &clock) {
            r.process_received_frame(&frame, -60, 8.0);
        }
        assert_eq!(r.stats().forwarded, 0);
        assert_eq!(r.neighbors().len(), 1);
    }

    #[test]
    fn test_discovery_beacon_respects_ttl() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut r = node(3, "relay", DeviceMode::Repeater, &clock);
        a.config.beacon.discovery_ttl = 1;

        a.send_beacon(BeaconKind::Discovery).unwrap();
        let frames = flush(&mut a, &clock);
        let mut packet = Packet::decode(&frames[0]).unwrap();
        assert_eq!(packet.version(), 1);

        // Already one hop out: the relay must not extend it
        packet.path_append(0xEE).unwrap();
        r.process_received_frame(&packet.to_bytes().unwrap(), -60, 8.0);
        assert_eq!(r.stats().forwarded, 0);
        assert_eq!(r.neighbors().find(a.hash()).unwrap().protocol_version, 1);
    }

    #[test]
    fn test_discovery_bloom_merge() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        let mut c = node(4, "carol", DeviceMode::Client, &clock);
        introduce(&mut a, &mut b, &clock);
        assert_eq!(b.bloom().check(a.identity().v1_hash()), Some(0));

        b.send_beacon(BeaconKind::Discovery).unwrap();
        for frame in flush(&mut b, &clock) {
            c.process_received_frame(&frame, -60, 8.0);
        }
        // Bob is adjacent, Alice one further out
        assert_eq!(c.bloom().check(b.identity().v1_hash()), Some(0));
        assert_eq!(c.bloom().check(a.identity().v1_hash()), Some(1));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);

        a.send_advertisement(false).unwrap();
        let mut packet = Packet::decode(&flush(&mut a, &clock)[0]).unwrap();
        let last = packet.payload.len() - 1;
        packet.payload[last] ^= 0x01;
        b.process_received_frame(&packet.to_bytes().unwrap(), -60, 8.0);

        assert!(b.neighbors().is_empty());
        assert_eq!(b.stats().auth_failures, 1);
        assert_eq!(b.stats().dropped, 1);
    }

    #[test]
    fn test_trace_end_replies_with_path() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Repeater, &clock);
        let mut c = node(4, "carol", DeviceMode::Client, &clock);

        let trace_id = a.trace(&[b.hash()]).unwrap();
        let frames = flush(&mut a, &clock);

        // Bob is the listed hop: append SNR and pass it on
        b.process_received_frame(&frames[0], -60, 5.0);
        let relayed = flush(&mut b, &clock);
        assert_eq!(relayed.len(), 1);
        assert_eq!(Packet::decode(&relayed[0]).unwrap().path, vec![20]);

        // Alice hears the finished trace come back
        a.process_received_frame(&relayed[0], -60, 2.0);
        match a.drain_events().as_slice() {
            [MeshEvent::TraceResult { trace_id: id, hops, snrs, rtt_ms }] => {
                assert_eq!(*id, trace_id);
                assert_eq!(*hops, 1);
                assert_eq!(snrs, &vec![20, 8]);
                assert!(rtt_ms.is_some());
            }
            other => panic!("unexpected events {:?}", other),
        }

        // A bystander at the end of the route answers with a flood PATH
        c.process_received_frame(&relayed[0], -60, 1.0);
        let reply = flush(&mut c, &clock);
        let path = Packet::decode(&reply[0]).unwrap();
        assert_eq!(path.payload_type(), PayloadType::Path);
        assert_eq!(path.route(), RouteType::Flood);
        assert_eq!(&path.payload[..4], &trace_id.to_le_bytes());
        assert_eq!(&path.payload[4..], &[1, 20, 4]);
    }

    #[test]
    fn test_rate_limit() {
        let clock = ManualClock::new(0);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        for i in 0..12u8 {
            let mut packet = Packet::new(RouteType::Flood, PayloadType::RawCustom, vec![i, i, i]);
            packet.path_append(0x77).unwrap();
            b.process_received_frame(&packet.to_bytes().unwrap(), 0, 0.0);
        }
        assert_eq!(b.stats().rate_limited, 2);
    }

    #[test]
    fn test_state_survives_restart() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        introduce(&mut a, &mut b, &clock);
        b.add_channel("ops", &[9; 16]).unwrap();
        b.save_state().unwrap();

        let store = b.store().clone();
        let mut reborn = MeshNode::new(
            b.config().clone(),
            Identity::from_seed(&[2; 32]),
            SimRadio::new(),
            clock.clone(),
            StdRng::seed_from_u64(99),
            store,
        );
        reborn.start().unwrap();
        let peer = reborn.neighbors().find(a.hash()).unwrap();
        assert!(peer.secret_valid());
        assert!(reborn.channels().get("ops").is_some());
    }

    #[test]
    fn test_saved_watermark_blocks_replay_after_restart() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        introduce(&mut a, &mut b, &clock);

        a.send_text(b.hash(), "once").unwrap();
        let frames = flush(&mut a, &clock);
        b.process_received_frame(&frames[0], -60, 8.0);
        assert_eq!(b.neighbors().find(a.hash()).unwrap().last_seq_rx, 1);
        b.save_state().unwrap();

        let mut reborn = MeshNode::new(
            b.config().clone(),
            Identity::from_seed(&[2; 32]),
            SimRadio::new(),
            clock.clone(),
            StdRng::seed_from_u64(7),
            b.store().clone(),
        );
        reborn.start().unwrap();
        assert_eq!(reborn.neighbors().find(a.hash()).unwrap().last_seq_rx, 1);

        // Restored entries learn the peer's generation from its next advert
        a.send_advertisement(false).unwrap();
        for frame in flush(&mut a, &clock) {
            reborn.process_received_frame(&frame, -60, 8.0);
        }
        reborn.drain_events();
        reborn.process_received_frame(&frames[0], -60, 8.0);
        assert!(reborn.drain_events().is_empty());
        assert_eq!(reborn.stats().replays, 1);
    }

    #[test]
    fn test_full_queue_keeps_sequence_and_skips_fallback() {
        let clock = ManualClock::new(1_000_000);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        let mut b = node(2, "bob", DeviceMode::Client, &clock);
        introduce(&mut a, &mut b, &clock);
        assert_eq!(a.config().policy, FallbackPolicy::Fallback);

        let slots = a.tx_queue().config().queue_slots;
        for _ in a.tx_queue().len()..slots {
            a.enqueue_for_send(vec![0x11; 8], 3_600_000, 9).unwrap();
        }
        assert!(matches!(a.send_text(b.hash(), "blocked"), Err(MeshError::QueueFull)));
        assert_eq!(a.stats().queue_drops, 1);
        assert_eq!(a.neighbors().find(b.hash()).unwrap().next_seq_tx, 1);
    }

    #[test]
    fn test_tick_sends_start_advert_and_beacons() {
        let clock = ManualClock::new(0);
        let mut a = node(1, "alice", DeviceMode::Client, &clock);
        a.start().unwrap();
        clock.advance(10);
        a.tick();
        let first = a.radio_mut().take_sent();
        assert_eq!(first.len(), 1);
        assert_eq!(Packet::decode(&first[0]).unwrap().route(), RouteType::Flood);

        // Trickle fires a local beacon within its first interval
        let mut local = 0;
        for _ in 0..40 {
            clock.advance(1_000);
            a.tick();
            local += a.radio_mut().take_sent().len();
        }
        assert!(local >= 1);
        assert_eq!(a.stats().tx as usize, 1 + local);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"name":"hill","mode":"Repeater"}"#).unwrap();
        assert_eq!(config.name, "hill");
        assert_eq!(config.mode, DeviceMode::Repeater);
        assert!(config.v1_enabled);
        assert_eq!(config.beacon.discovery_ttl, 16);
    }
}
