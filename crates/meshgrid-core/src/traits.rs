//! Collaborator traits
//!
//! The engine never touches hardware directly. Everything outside the
//! protocol core is reached through these traits:
//!
//! - **Radio**: transmit a frame, re-arm the receiver
//! - **Clock**: monotonic milliseconds plus wall-clock seconds
//! - **KvStore**: small key/value persistence (neighbors, channels)
//!
//! Randomness comes from any [`rand::RngCore`].

use crate::error::MeshResult;
use std::cell::Cell;
use std::rc::Rc;

/// Half-duplex radio backend
///
/// One implementation per chip family. `transmit` blocks until the frame
/// is on air (or fails); the engine calls `start_receive` afterwards.
pub trait Radio {
    /// Send one encoded frame
    fn transmit(&mut self, frame: &[u8]) -> MeshResult<()>;

    /// Return to receive mode
    fn start_receive(&mut self) -> MeshResult<()>;
}

/// Time source
pub trait Clock {
    /// Monotonic milliseconds since boot
    fn now_ms(&self) -> u64;

    /// Wall-clock seconds (advert timestamps, message timestamps)
    fn unix_time(&self) -> u32 {
        (self.now_ms() / 1000) as u32
    }
}

/// Key/value persistence
pub trait KvStore {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn put(&mut self, key: &str, value: &[u8]) -> MeshResult<()>;
}

/// A clock that only moves when told to
///
/// Clones share the same underlying time, so a test or simulator can keep
/// one handle and pass another to the node.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get().saturating_add(ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

/// Wall clock backed by `std::time`
#[derive(Debug, Clone)]
pub struct SystemClock {
    boot: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn unix_time(&self) -> u32 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(1000);
        let handle = clock.clone();
        handle.advance(500);
        assert_eq!(clock.now_ms(), 1500);
        assert_eq!(clock.unix_time(), 1);
        clock.set(42_000);
        assert_eq!(handle.now_ms(), 42_000);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(clock.unix_time() > 1_600_000_000);
    }
}
