//! Beacon scheduling
//!
//! Three kinds of self-announcement, each on its own clock:
//!
//! | Kind      | Interval | Frame                                        |
//! |-----------|----------|----------------------------------------------|
//! | Local     | 2 min    | v0 advert, zero-hop direct (MeshCore-visible)|
//! | Discovery | 30 min   | v1 advert with TTL and Bloom filter, flooded |
//! | Flood     | 12 h     | v0 advert, flooded                           |
//!
//! When adaptive mode is on the local interval is driven by the
//! [`Trickle`](crate::trickle::Trickle) timer instead of the fixed clock.
//! A discovery beacon can also be requested by the user at any time.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconConfig {
    pub local_interval_ms: u64,
    pub discovery_interval_ms: u64,
    /// Hops a discovery beacon may travel
    pub discovery_ttl: u8,
    pub flood_advert_interval_ms: u64,
    /// Let Trickle pace local beacons
    pub adaptive: bool,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            local_interval_ms: 2 * 60 * 1000,
            discovery_interval_ms: 30 * 60 * 1000,
            discovery_ttl: 16,
            flood_advert_interval_ms: 12 * 60 * 60 * 1000,
            adaptive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconKind {
    Local,
    Discovery,
    FloodAdvert,
}

/// Fixed-interval beacon clocks
#[derive(Debug, Clone)]
pub struct BeaconSchedule {
    config: BeaconConfig,
    next_local: u64,
    next_discovery: u64,
    next_flood: u64,
    user_triggered: bool,
}

impl BeaconSchedule {
    pub fn new(config: BeaconConfig, now_ms: u64) -> Self {
        Self {
            next_local: now_ms + config.local_interval_ms,
            next_discovery: now_ms + config.discovery_interval_ms,
            next_flood: now_ms + config.flood_advert_interval_ms,
            user_triggered: false,
            config,
        }
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    pub fn should_send_local(&self, now_ms: u64) -> bool {
        now_ms >= self.next_local
    }

    pub fn local_sent(&mut self, now_ms: u64) {
        self.next_local = now_ms + self.config.local_interval_ms;
    }

    pub fn should_send_discovery(&self, now_ms: u64) -> bool {
        self.user_triggered || now_ms >= self.next_discovery
    }

    pub fn discovery_sent(&mut self, now_ms: u64) {
        self.user_triggered = false;
        self.next_discovery = now_ms + self.config.discovery_interval_ms;
    }

    /// Send a discovery beacon on the next tick
    pub fn trigger_discovery(&mut self) {
        self.user_triggered = true;
    }

    pub fn is_discovery_triggered(&self) -> bool {
        self.user_triggered
    }

    pub fn should_send_flood_advert(&self, now_ms: u64) -> bool {
        now_ms >= self.next_flood
    }

    pub fn flood_advert_sent(&mut self, now_ms: u64) {
        self.next_flood = now_ms + self.config.flood_advert_interval_ms;
    }

    pub fn time_until_local(&self, now_ms: u64) -> u64 {
        self.next_local.saturating_sub(now_ms)
    }

    pub fn time_until_discovery(&self, now_ms: u64) -> u64 {
        if self.user_triggered {
            return 0;
        }
        self.next_discovery.saturating_sub(now_ms)
    }
}
