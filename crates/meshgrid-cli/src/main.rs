//! meshgrid command-line interface
//!
//! Tools for working with the mesh engine off-device:
//! - Decoding captured frames
//! - Building signed adverts
//! - Running a multi-node simulation
//! - Inspecting a persisted neighbor store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshgrid_core::advert::{build_advertisement, Advert};
use meshgrid_core::channel::ChannelTable;
use meshgrid_core::crypto::{self, Identity};
use meshgrid_core::node::{MeshEvent, NodeConfig};
use meshgrid_core::packet::{Packet, PayloadType, MAX_PACKET_SIZE, MAX_PATH_SIZE, MAX_PAYLOAD_SIZE};
use meshgrid_core::session;
use meshgrid_core::simulation::{SimConfig, Simulator};
use meshgrid_core::store::{self, JsonFileStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "meshgrid")]
#[command(author, version, about = "MeshCore-compatible LoRa mesh tools", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Node configuration (JSON); missing fields take defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a hex-encoded frame
    Decode {
        /// Frame bytes as hex
        frame: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Build a signed advert frame
    Advert {
        /// 32-byte identity seed as hex (random if omitted)
        #[arg(long)]
        seed: Option<String>,

        /// Advertised name (defaults to the config name)
        #[arg(short, long)]
        name: Option<String>,

        /// Advert timestamp in unix seconds
        #[arg(long, default_value = "0")]
        timestamp: u32,
    },

    /// Run a multi-node simulation
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value = "8")]
        nodes: usize,

        /// Simulated duration in seconds
        #[arg(short, long, default_value = "600")]
        duration: u64,

        /// Channel messages to send during the run
        #[arg(short, long, default_value = "5")]
        messages: usize,

        /// Square area side in meters
        #[arg(long, default_value = "20000")]
        area: f64,

        /// Fraction of nodes that repeat
        #[arg(long, default_value = "0.5")]
        repeaters: f64,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Print every event as it is drained
        #[arg(long)]
        events: bool,
    },

    /// List neighbors persisted in a store file
    Neighbors {
        /// Store file written by a node
        #[arg(short, long)]
        store: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show protocol limits and the loaded configuration
    Info,
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).with_context(|| format!("Not valid hex: {}", input))
}

fn cmd_decode(frame: String, json: bool) -> Result<()> {
    let bytes = parse_hex(&frame)?;
    let packet = Packet::decode(&bytes).context("Failed to decode frame")?;

    let advert = if packet.payload_type() == PayloadType::Advert {
        match Advert::parse(&packet.payload, packet.version()) {
            Ok(advert) => Some(advert),
            Err(e) => {
                warn!("Advert payload did not parse: {}", e);
                None
            }
        }
    } else {
        None
    };

    if json {
        let mut value = serde_json::json!({
            "route": format!("{:?}", packet.route()),
            "payload_type": format!("{:?}", packet.payload_type()),
            "version": packet.version(),
            "transport_codes": packet.route().has_transport_codes().then_some(packet.transport_codes),
            "path": hex::encode(&packet.path),
            "payload": hex::encode(&packet.payload),
            "hash": packet.hash(),
        });
        if let Some(advert) = &advert {
            value["advert"] = serde_json::json!({
                "public_key": hex::encode(advert.public_key),
                "timestamp": advert.timestamp,
                "signature_valid": advert.verify(),
                "type": format!("{:?}", advert.app_data.adv_type),
                "name": advert.app_data.name,
                "v1": advert.app_data.supports_v1(),
                "discovery_ttl": advert.app_data.discovery.as_ref().map(|d| d.ttl),
            });
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("=== Frame ({} bytes) ===", bytes.len());
    println!("Route:        {:?}", packet.route());
    println!("Payload type: {:?}", packet.payload_type());
    println!("Version:      {}", packet.version());
    if packet.route().has_transport_codes() {
        println!(
            "Transport:    {:04x} {:04x}",
            packet.transport_codes[0], packet.transport_codes[1]
        );
    }
    println!("Path ({:2}):    {}", packet.path_len(), hex::encode(&packet.path));
    println!("Payload ({:3}): {}", packet.payload.len(), hex::encode(&packet.payload));
    println!("Dedup hash:   {:02x}", packet.hash());

    if let Some(advert) = advert {
        println!();
        println!("=== Advert ===");
        println!("Public key: {}", hex::encode(advert.public_key));
        println!("Hash:       {:02x}", advert.hash());
        println!("Timestamp:  {}", advert.timestamp);
        println!("Signature:  {}", if advert.verify() { "valid" } else { "INVALID" });
        println!("Type:       {:?}", advert.app_data.adv_type);
        if let Some(name) = &advert.app_data.name {
            println!("Name:       {}", name);
        }
        if let Some((lat, lon)) = advert.app_data.location {
            println!("Location:   {:.6}, {:.6}", lat as f64 / 1e6, lon as f64 / 1e6);
        }
        println!("v1 capable: {}", advert.app_data.supports_v1());
        if let Some(discovery) = &advert.app_data.discovery {
            println!(
                "Discovery:  ttl={} bloom entries={}",
                discovery.ttl,
                discovery.bloom.count_total()
            );
        }
    }
    Ok(())
}

fn cmd_advert(config: &NodeConfig, seed: Option<String>, name: Option<String>, timestamp: u32) -> Result<()> {
    let identity = match seed {
        Some(seed) => {
            let bytes = parse_hex(&seed)?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|b: Vec<u8>| anyhow::anyhow!("Seed must be 32 bytes, got {}", b.len()))?;
            Identity::from_seed(&seed)
        }
        None => {
            let identity = Identity::generate(&mut rand::thread_rng());
            println!("Seed:       {}", hex::encode(identity.seed()));
            identity
        }
    };
    let name = name.unwrap_or_else(|| config.name.clone());

    let packet = build_advertisement(&identity, &name, timestamp);
    let frame = packet.to_bytes().context("Failed to encode advert")?;

    println!("Public key: {}", hex::encode(identity.public_key()));
    println!("Hash:       {:02x} (v1 {:04x})", identity.hash(), identity.v1_hash());
    println!("Frame:      {}", hex::encode(frame));
    Ok(())
}

fn cmd_simulate(
    config: NodeConfig,
    num_nodes: usize,
    duration_s: u64,
    num_messages: usize,
    area: f64,
    repeaters: f64,
    seed: u64,
    print_events: bool,
) -> Result<()> {
    let sim_config = SimConfig {
        node: config,
        ..SimConfig::default()
    }
    .with_node_count(num_nodes)
    .with_area(area, area)
    .with_repeater_ratio(repeaters)
    .with_seed(seed);
    let step_ms = sim_config.step_ms;

    println!("=== Mesh Simulation ===");
    println!();
    println!("Nodes:     {}", num_nodes);
    println!("Area:      {:.0} m x {:.0} m", area, area);
    println!("Repeaters: {:.0}%", repeaters * 100.0);
    println!("Duration:  {} s", duration_s);
    println!("Messages:  {}", num_messages);
    println!("Seed:      {}", seed);
    println!();

    let mut sim = Simulator::new(sim_config);
    sim.start().context("Failed to start nodes")?;

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let total_steps = duration_s * 1000 / step_ms.max(1);
    let mut message_steps: Vec<u64> = {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        (0..num_messages).map(|_| rng.gen_range(0..total_steps.max(1))).collect()
    };
    message_steps.sort_unstable();
    let mut sender_rng = StdRng::seed_from_u64(seed.wrapping_add(1));

    let mut sent = 0usize;
    let mut received = 0usize;
    let mut discovered = 0usize;

    for step in 0..total_steps {
        if !running.load(Ordering::SeqCst) {
            println!("Interrupted at {:.1} s", sim.now_ms() as f64 / 1000.0);
            break;
        }

        while message_steps.first() == Some(&step) {
            message_steps.remove(0);
            let src = sender_rng.gen_range(0..sim.node_count().max(1));
            let text = format!("msg {} from node {}", sent, src);
            if let Some(node) = sim.node_mut(src) {
                match node.send_channel(meshgrid_core::channel::PUBLIC_CHANNEL_NAME, &text) {
                    Ok(_) => sent += 1,
                    Err(e) => warn!("Node {} could not send: {}", src, e),
                }
            }
        }

        sim.step();

        for (idx, event) in sim.drain_events() {
            match &event {
                MeshEvent::ChannelMessage { .. } => received += 1,
                MeshEvent::NeighborDiscovered { .. } => discovered += 1,
                _ => {}
            }
            if print_events {
                println!("[{:>8.1}s] node {:2}: {:?}", sim.now_ms() as f64 / 1000.0, idx, event);
            }
        }
    }

    sim.print_summary();
    println!();
    println!("=== Results ===");
    println!("Channel messages sent:      {}", sent);
    println!("Channel messages delivered: {}", received);
    if sent > 0 && num_nodes > 1 {
        println!(
            "Delivery rate:              {:.1}%",
            received as f64 / (sent * (num_nodes - 1)) as f64 * 100.0
        );
    }
    println!("Neighbor discoveries:       {}", discovered);
    println!("Connected:                  {}", sim.is_connected());
    Ok(())
}

fn cmd_neighbors(path: PathBuf, json: bool) -> Result<()> {
    let store = JsonFileStore::open(&path)
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    let Some(saved) = store::load_neighbors(&store) else {
        println!("No neighbors stored in {}", path.display());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
        return Ok(());
    }

    println!("Neighbor store v{} ({} entries)", saved.version, saved.neighbors.len());
    println!("{:<6} {:<18} {:<10} {:<10} {}", "Hash", "Name", "Seq RX", "Seq TX", "Public key");
    println!("{}", "-".repeat(110));
    for n in &saved.neighbors {
        println!(
            "{:02x}     {:<18} {:<10} {:<10} {}",
            n.hash,
            n.name,
            n.last_seq_rx,
            n.next_seq_tx,
            hex::encode(n.public_key)
        );
    }

    let channels = store::load_channels(&store);
    if !channels.is_empty() {
        println!();
        println!("Channels:");
        for c in channels {
            println!("  {:02x} {}", crypto::channel_hash(&c.psk), c.name);
        }
    }
    Ok(())
}

fn cmd_info(config: &NodeConfig) -> Result<()> {
    println!("=== meshgrid protocol ===");
    println!();
    println!("Frame limits:");
    println!("  Packet:  {} bytes", MAX_PACKET_SIZE);
    println!("  Payload: {} bytes", MAX_PAYLOAD_SIZE);
    println!("  Path:    {} hops", MAX_PATH_SIZE);
    println!();
    println!("Text capacity:");
    println!("  v0 direct: {} bytes", session::max_v0_direct_text());
    println!("  v0 group:  {} bytes", session::max_v0_group_text());
    println!("  v1 direct: {} bytes", session::max_v1_direct_text());
    println!("  v1 group:  {} bytes", session::max_v1_group_text());
    println!();
    println!("Channels:");
    for channel in ChannelTable::new().iter() {
        println!("  {:02x} {}", channel.hash(), channel.name());
    }
    println!();
    println!("Configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Decode { frame, json } => cmd_decode(frame, json),

        Commands::Advert {
            seed,
            name,
            timestamp,
        } => cmd_advert(&config, seed, name, timestamp),

        Commands::Simulate {
            nodes,
            duration,
            messages,
            area,
            repeaters,
            seed,
            events,
        } => cmd_simulate(config, nodes, duration, messages, area, repeaters, seed, events),

        Commands::Neighbors { store, json } => cmd_neighbors(store, json),

        Commands::Info => cmd_info(&config),
    }
}
