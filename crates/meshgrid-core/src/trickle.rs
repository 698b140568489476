//! Trickle timer (RFC 6206)
//!
//! Adapts the local beacon rate to how stable the neighborhood is:
//!
//! - Each interval `I` picks one beacon time uniformly in `[I/2, I)`.
//! - Hearing `k` consistent beacons within an interval suppresses ours.
//! - When an interval ends without change, `I` doubles up to `Imax`.
//! - Any inconsistency (new or lost neighbor) resets `I` to `Imin`.
//!
//! A quiet network converges to one beacon per `Imax`; a changing one
//! beacons every few seconds until it settles.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrickleConfig {
    pub interval_min_ms: u64,
    pub interval_max_ms: u64,
    /// Redundancy constant
    pub k: u8,
}

impl Default for TrickleConfig {
    fn default() -> Self {
        Self {
            interval_min_ms: 30_000,
            interval_max_ms: 600_000,
            k: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trickle {
    interval_min: u64,
    interval_max: u64,
    k: u8,
    interval: u64,
    interval_start: u64,
    next_beacon_time: u64,
    redundant_count: u8,
    suppress: bool,
    active: bool,
}

impl Trickle {
    pub fn new(config: &TrickleConfig) -> Self {
        let interval_min = config.interval_min_ms.max(2);
        Self {
            interval_min,
            interval_max: config.interval_max_ms.max(interval_min),
            k: config.k,
            interval: interval_min,
            interval_start: 0,
            next_beacon_time: 0,
            redundant_count: 0,
            suppress: false,
            active: false,
        }
    }

    fn start_interval<G: Rng>(&mut self, now_ms: u64, rng: &mut G) {
        self.interval_start = now_ms;
        self.redundant_count = 0;
        self.suppress = false;
        let half = self.interval / 2;
        self.next_beacon_time = now_ms.saturating_add(rng.gen_range(half..self.interval));
    }

    pub fn start<G: Rng>(&mut self, now_ms: u64, rng: &mut G) {
        self.interval = self.interval_min;
        self.active = true;
        self.start_interval(now_ms, rng);
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    /// Something changed; beacon soon
    pub fn reset<G: Rng>(&mut self, now_ms: u64, rng: &mut G) {
        if !self.active {
            return;
        }
        self.interval = self.interval_min;
        self.start_interval(now_ms, rng);
    }

    pub fn heard_beacon(&mut self, consistent: bool) {
        if !self.active || !consistent {
            return;
        }
        self.redundant_count = self.redundant_count.saturating_add(1);
        if self.redundant_count >= self.k {
            self.suppress = true;
        }
    }

    /// Roll over to a doubled interval once the current one has elapsed
    pub fn update<G: Rng>(&mut self, now_ms: u64, rng: &mut G) {
        if !self.active {
            return;
        }
        if now_ms.saturating_sub(self.interval_start) >= self.interval {
            self.interval = self.interval.saturating_mul(2).min(self.interval_max);
            self.start_interval(now_ms, rng);
        }
    }

    pub fn should_beacon(&self, now_ms: u64) -> bool {
        self.active && now_ms >= self.next_beacon_time && !self.suppress
    }

    /// Push the next beacon to the end of the interval
    pub fn beacon_sent(&mut self) {
        self.next_beacon_time = self.interval_start.saturating_add(self.interval);
    }

    pub fn time_until_beacon(&self, now_ms: u64) -> u64 {
        if !self.active {
            return u64::MAX;
        }
        self.next_beacon_time.saturating_sub(now_ms)
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress
    }

    pub fn redundant_count(&self) -> u8 {
        self.redundant_count
    }
}

impl Default for Trickle {
    fn default() -> Self {
        Self::new(&TrickleConfig::default())
    }
}
