//! # meshgrid core
//!
//! Protocol engine for a LoRa mesh node that speaks the MeshCore wire
//! format (v0) and adds an authenticated, replay-protected v1 layer on
//! top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Host (firmware / CLI)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                  │ process_received_frame / tick
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             MeshNode                                    │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  dispatch   │  │  sessions   │  │  beacons    │  │   events    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │                 │                 │                 │
//!          ▼                 ▼                 ▼                 ▼
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │   routing    │  │  neighbor    │  │ trickle/bloom│  │     mac      │
//! │ seen, limits │  │ table, keys  │  │  discovery   │  │ queue, duty  │
//! └──────────────┘  └──────────────┘  └──────────────┘  └──────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │        Radio · Clock · RngCore · KvStore  (host-provided traits)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshgrid_core::prelude::*;
//! use meshgrid_core::simulation::SimRadio;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let mut rng = StdRng::seed_from_u64(1);
//! let identity = Identity::generate(&mut rng);
//! let mut node = MeshNode::new(
//!     NodeConfig::default(),
//!     identity,
//!     SimRadio::new(),
//!     ManualClock::new(0),
//!     rng,
//!     MemoryStore::new(),
//! );
//! node.start()?;
//! node.tick();
//! for event in node.drain_events() {
//!     println!("{:?}", event);
//! }
//! # Ok::<(), meshgrid_core::MeshError>(())
//! ```

pub mod advert;
pub mod beacon;
pub mod bloom;
pub mod channel;
pub mod crypto;
pub mod error;
pub mod mac;
pub mod neighbor;
pub mod node;
pub mod packet;
pub mod routing;
pub mod session;
pub mod simulation;
pub mod store;
pub mod traits;
pub mod trickle;

pub use advert::{Advert, AdvertType, AppData};
pub use channel::{Channel, ChannelTable};
pub use crypto::{Identity, SharedSecret};
pub use error::{CodecError, CryptoError, MeshError, MeshResult};
pub use neighbor::{Neighbor, NeighborSnapshot, NeighborTable};
pub use node::{MeshEvent, MeshNode, MeshStats, NodeConfig};
pub use packet::{Packet, PayloadType, RouteType};
pub use routing::DeviceMode;
pub use session::{FallbackPolicy, Protocol};
pub use store::{JsonFileStore, MemoryStore};
pub use traits::{Clock, KvStore, ManualClock, Radio, SystemClock};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crypto::Identity;
    pub use crate::error::{MeshError, MeshResult};
    pub use crate::node::{MeshEvent, MeshNode, NodeConfig};
    pub use crate::packet::{Packet, PayloadType, RouteType};
    pub use crate::routing::DeviceMode;
    pub use crate::session::Protocol;
    pub use crate::store::MemoryStore;
    pub use crate::traits::{Clock, KvStore, ManualClock, Radio};
}
