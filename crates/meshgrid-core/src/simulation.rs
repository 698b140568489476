//! Multi-node mesh simulation
//!
//! Runs real [`MeshNode`]s over a virtual shared channel, without hardware.
//! It models:
//!
//! - node positions on a plane
//! - log-distance path loss, giving each link an RSSI and SNR
//! - half-duplex radios (a node transmitting this step hears nothing)
//!
//! All nodes share one [`ManualClock`]; each gets a seeded `StdRng` and a
//! [`MemoryStore`], so a run is reproducible from its seed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshgrid_core::simulation::{SimConfig, Simulator};
//!
//! let mut sim = Simulator::new(SimConfig::default().with_node_count(5));
//! sim.start().unwrap();
//! sim.run(600);
//! sim.print_summary();
//! ```

use crate::crypto::Identity;
use crate::error::{MeshError, MeshResult};
use crate::node::{MeshEvent, MeshNode, NodeConfig};
use crate::routing::DeviceMode;
use crate::store::MemoryStore;
use crate::traits::{Clock, ManualClock, Radio};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Radio that records what it is asked to send
#[derive(Debug, Default)]
pub struct SimRadio {
    sent: Vec<Vec<u8>>,
    /// Make every transmit fail
    pub fail_transmit: bool,
    receiving: bool,
}

impl SimRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames sent since the last call
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }
}

impl Radio for SimRadio {
    fn transmit(&mut self, frame: &[u8]) -> MeshResult<()> {
        self.receiving = false;
        if self.fail_transmit {
            return Err(MeshError::Radio("simulated transmit failure".into()));
        }
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn start_receive(&mut self) -> MeshResult<()> {
        self.receiving = true;
        Ok(())
    }
}

pub type SimNode = MeshNode<SimRadio, ManualClock, StdRng, MemoryStore>;

/// Node position in 2D space (meters)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

impl NodePosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &NodePosition) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub node_count: usize,
    /// Area width (meters)
    pub area_width: f64,
    /// Area height (meters)
    pub area_height: f64,
    pub tx_power_dbm: f64,
    /// Path loss exponent (2.0 free space, 3.0-4.0 urban)
    pub path_loss_exponent: f64,
    /// Reference distance for path loss (meters)
    pub reference_distance: f64,
    pub noise_floor_dbm: f64,
    /// Weakest SNR that still decodes; LoRa works below zero
    pub min_snr_db: f64,
    /// Simulated time per step
    pub step_ms: u64,
    /// Fraction of nodes that repeat
    pub repeater_ratio: f64,
    pub seed: u64,
    /// Template for every node; name and mode are filled in per node
    pub node: NodeConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 10,
            area_width: 20_000.0,
            area_height: 20_000.0,
            tx_power_dbm: 20.0,
            path_loss_exponent: 2.8,
            reference_distance: 1.0,
            noise_floor_dbm: -120.0,
            min_snr_db: -5.0,
            step_ms: 100,
            repeater_ratio: 0.5,
            seed: 42,
            node: NodeConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_area(mut self, width: f64, height: f64) -> Self {
        self.area_width = width;
        self.area_height = height;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_repeater_ratio(mut self, ratio: f64) -> Self {
        self.repeater_ratio = ratio;
        self
    }
}

/// Channel-level counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimStats {
    pub steps: u64,
    pub frames_transmitted: u64,
    /// Frame copies handed to a receiver
    pub frames_delivered: u64,
    /// Copies too weak to decode
    pub frames_out_of_range: u64,
    /// Copies missed because the receiver was transmitting
    pub frames_missed_half_duplex: u64,
}

struct SimEntry {
    node: SimNode,
    position: NodePosition,
}

/// Virtual air shared by a set of nodes
pub struct Simulator {
    config: SimConfig,
    clock: ManualClock,
    nodes: Vec<SimEntry>,
    stats: SimStats,
}

impl Simulator {
    /// Nodes at random positions; the first `repeater_ratio` share repeat
    pub fn new(config: SimConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let positions = (0..config.node_count)
            .map(|_| {
                NodePosition::new(
                    rng.gen_range(0.0..config.area_width.max(1.0)),
                    rng.gen_range(0.0..config.area_height.max(1.0)),
                )
            })
            .collect();
        let repeaters = (config.node_count as f64 * config.repeater_ratio).round() as usize;
        Self::with_positions(config, positions, |i| {
            if i < repeaters {
                DeviceMode::Repeater
            } else {
                DeviceMode::Client
            }
        })
    }

    /// Nodes at fixed positions with the given modes
    pub fn with_positions(
        config: SimConfig,
        positions: Vec<NodePosition>,
        mode_for: impl Fn(usize) -> DeviceMode,
    ) -> Self {
        let clock = ManualClock::new(0);
        let nodes = positions
            .into_iter()
            .enumerate()
            .map(|(i, position)| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(i as u64 + 1));
                let identity = Identity::generate(&mut rng);
                let node_config = NodeConfig {
                    name: format!("node-{}", i),
                    mode: mode_for(i),
                    ..config.node.clone()
                };
                debug!(
                    "Node {} {:02x} at ({:.0}, {:.0}) {:?}",
                    i,
                    identity.hash(),
                    position.x,
                    position.y,
                    node_config.mode
                );
                let node = MeshNode::new(
                    node_config,
                    identity,
                    SimRadio::new(),
                    clock.clone(),
                    rng,
                    MemoryStore::new(),
                );
                SimEntry { node, position }
            })
            .collect();

        Self {
            config,
            clock,
            nodes,
            stats: SimStats::default(),
        }
    }

    /// Boot every node
    pub fn start(&mut self) -> MeshResult<()> {
        for entry in &mut self.nodes {
            entry.node.start()?;
        }
        info!("Simulation started with {} nodes", self.nodes.len());
        Ok(())
    }

    /// Received power over a link, log-distance model
    pub fn rssi_between(&self, a: &NodePosition, b: &NodePosition) -> f64 {
        let d0 = self.config.reference_distance;
        let distance = a.distance_to(b).max(d0);
        // PL(d) = PL(d0) + 10 n log10(d/d0), with PL(d0) free-space at ~900 MHz
        let pl_reference = 20.0 * (4.0 * std::f64::consts::PI * d0 / 0.33).log10();
        let path_loss = pl_reference + 10.0 * self.config.path_loss_exponent * (distance / d0).log10();
        self.config.tx_power_dbm - path_loss
    }

    /// `(rssi, snr)` from node `from` to node `to`, if it decodes
    pub fn link(&self, from: usize, to: usize) -> Option<(f64, f64)> {
        let a = self.nodes.get(from)?.position;
        let b = self.nodes.get(to)?.position;
        let rssi = self.rssi_between(&a, &b);
        let snr = rssi - self.config.noise_floor_dbm;
        (snr >= self.config.min_snr_db).then_some((rssi, snr))
    }

    /// Advance time by one step: tick every node, then deliver what went on air
    pub fn step(&mut self) {
        self.clock.advance(self.config.step_ms);
        self.stats.steps += 1;

        let mut on_air = Vec::new();
        for (i, entry) in self.nodes.iter_mut().enumerate() {
            entry.node.tick();
            for frame in entry.node.radio_mut().take_sent() {
                on_air.push((i, frame));
            }
        }
        self.stats.frames_transmitted += on_air.len() as u64;

        let talkers: Vec<usize> = on_air.iter().map(|(i, _)| *i).collect();
        for (from, frame) in &on_air {
            for to in 0..self.nodes.len() {
                if to == *from {
                    continue;
                }
                let Some((rssi, snr)) = self.link(*from, to) else {
                    self.stats.frames_out_of_range += 1;
                    continue;
                };
                if talkers.contains(&to) {
                    self.stats.frames_missed_half_duplex += 1;
                    continue;
                }
                self.nodes[to]
                    .node
                    .process_received_frame(frame, rssi.round() as i16, snr as f32);
                self.stats.frames_delivered += 1;
            }
        }
    }

    pub fn run(&mut self, steps: u64) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Step until `condition` holds or `max_steps` pass; true if it held
    pub fn run_until<F>(&mut self, max_steps: u64, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        for _ in 0..max_steps {
            self.step();
            if condition(self) {
                return true;
            }
        }
        false
    }

    /// Events from every node, tagged with the node index
    pub fn drain_events(&mut self) -> Vec<(usize, MeshEvent)> {
        self.nodes
            .iter_mut()
            .enumerate()
            .flat_map(|(i, entry)| entry.node.drain_events().into_iter().map(move |e| (i, e)))
            .collect()
    }

    pub fn node(&self, idx: usize) -> Option<&SimNode> {
        self.nodes.get(idx).map(|e| &e.node)
    }

    pub fn node_mut(&mut self, idx: usize) -> Option<&mut SimNode> {
        self.nodes.get_mut(idx).map(|e| &mut e.node)
    }

    pub fn node_position(&self, idx: usize) -> Option<NodePosition> {
        self.nodes.get(idx).map(|e| e.position)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Which nodes each node has in its neighbor table
    pub fn topology(&self) -> Vec<Vec<usize>> {
        self.nodes
            .iter()
            .map(|entry| {
                self.nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, other)| entry.node.neighbors().get(other.node.identity().public_key()).is_some())
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect()
    }

    /// Whether every node knows, directly or transitively, about node 0
    pub fn is_connected(&self) -> bool {
        if self.nodes.is_empty() {
            return true;
        }
        let adj = self.topology();
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![0usize];
        while let Some(node) = stack.pop() {
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            stack.extend(adj[node].iter().copied().filter(|&n| !visited[n]));
        }
        visited.iter().all(|&v| v)
    }

    pub fn print_summary(&self) {
        println!("\n=== Mesh Simulation Summary ===");
        println!("Simulated time: {:.1} s ({} steps)", self.now_ms() as f64 / 1000.0, self.stats.steps);
        println!("Nodes: {}", self.nodes.len());
        println!();
        println!("Channel:");
        println!("  Transmitted: {}", self.stats.frames_transmitted);
        println!("  Delivered:   {}", self.stats.frames_delivered);
        println!("  Out of range: {}", self.stats.frames_out_of_range);
        println!("  Half-duplex misses: {}", self.stats.frames_missed_half_duplex);
        println!();
        println!("Per-node:");
        for (i, entry) in self.nodes.iter().enumerate() {
            let s = entry.node.stats();
            println!(
                "  {:2} {:02x} {:8?} rx={:4} tx={:4} fwd={:4} dup={:4} drop={:3} neighbors={}",
                i,
                entry.node.hash(),
                entry.node.config().mode,
                s.rx,
                s.tx,
                s.forwarded,
                s.duplicates,
                s.dropped,
                entry.node.neighbors().len()
            );
        }
    }
}
