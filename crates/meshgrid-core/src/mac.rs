//! Transmit scheduling and airtime control
//!
//! Outgoing frames wait in a fixed array of slots, each with a scheduled
//! time and a priority (lower is sooner). One frame at most leaves per
//! call to [`TxQueue::process`]:
//!
//! 1. After each transmit the node stays silent for `last_duration * 2`
//!    so neighbors get a chance to answer or forward.
//! 2. Among due slots the lowest priority wins; ties go to scan order.
//! 3. Airtime is estimated as `15 + 6 * len` ms.
//! 4. A rolling window (10 s, 33 %) caps the duty cycle. Frames that would
//!    break it stay queued; they are delayed, never dropped.
//!
//! A full queue drops the newest frame.

use crate::error::{MeshError, MeshResult};
use crate::traits::Radio;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fixed per-frame airtime estimate (ms)
pub const AIRTIME_OVERHEAD_MS: u64 = 15;
/// Per-byte airtime estimate (ms)
pub const AIRTIME_PER_BYTE_MS: u64 = 6;

/// Queue and duty-cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirtimeConfig {
    pub queue_slots: usize,
    /// Rolling budget window
    pub window_ms: u64,
    /// Share of the window we may transmit for
    pub budget_percent: u64,
    /// Post-transmit silence as a multiple of the last airtime
    pub silence_factor: u64,
    /// Minimum spacing of budget-refusal warnings
    pub refusal_log_interval_ms: u64,
}

impl Default for AirtimeConfig {
    fn default() -> Self {
        Self {
            queue_slots: 16,
            window_ms: 10_000,
            budget_percent: 33,
            silence_factor: 2,
            refusal_log_interval_ms: 5_000,
        }
    }
}

impl AirtimeConfig {
    pub fn budget_ms(&self) -> u64 {
        self.window_ms * self.budget_percent / 100
    }
}

/// Airtime estimate for a frame of `len` bytes
pub fn estimate_airtime(len: usize) -> u64 {
    AIRTIME_OVERHEAD_MS + AIRTIME_PER_BYTE_MS * len as u64
}

/// A frame waiting for its turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub frame: Vec<u8>,
    pub scheduled_ms: u64,
    pub priority: u8,
}

/// Result of one scheduling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Nothing due
    Idle,
    /// Inside the post-transmit silence period
    Silent,
    /// A frame was due but the duty-cycle budget is spent
    Deferred,
    /// Frame transmitted
    Sent { len: usize, airtime_ms: u64 },
    /// Radio refused the frame; it was discarded
    Failed { len: usize },
}

/// Rolling-window airtime accounting
#[derive(Debug, Clone, Default)]
pub struct AirtimeBudget {
    window_start_ms: u64,
    used_ms: u64,
    last_duration_ms: u64,
    last_tx_ms: u64,
}

impl AirtimeBudget {
    /// Still inside the silence that follows the last transmit
    pub fn in_silence(&self, now_ms: u64, silence_factor: u64) -> bool {
        let silence = self.last_duration_ms * silence_factor;
        silence > 0 && now_ms.saturating_sub(self.last_tx_ms) < silence
    }

    /// Whether `duration_ms` more airtime fits in the current window
    pub fn allows(&mut self, duration_ms: u64, now_ms: u64, config: &AirtimeConfig) -> bool {
        if now_ms.saturating_sub(self.window_start_ms) >= config.window_ms {
            self.window_start_ms = now_ms;
            self.used_ms = 0;
        }
        self.used_ms + duration_ms <= config.budget_ms()
    }

    pub fn record(&mut self, duration_ms: u64, now_ms: u64) {
        self.used_ms += duration_ms;
        self.last_duration_ms = duration_ms;
        self.last_tx_ms = now_ms;
    }

    pub fn used_ms(&self) -> u64 {
        self.used_ms
    }

    pub fn last_duration_ms(&self) -> u64 {
        self.last_duration_ms
    }
}

/// Priority slot queue in front of the radio
#[derive(Debug)]
pub struct TxQueue {
    slots: Vec<Option<QueuedPacket>>,
    budget: AirtimeBudget,
    config: AirtimeConfig,
    last_refusal_log_ms: Option<u64>,
}

impl TxQueue {
    pub fn new(config: AirtimeConfig) -> Self {
        Self {
            slots: vec![None; config.queue_slots.max(1)],
            budget: AirtimeBudget::default(),
            config,
            last_refusal_log_ms: None,
        }
    }

    pub fn config(&self) -> &AirtimeConfig {
        &self.config
    }

    pub fn budget(&self) -> &AirtimeBudget {
        &self.budget
    }

    /// Place a frame in the first free slot
    pub fn enqueue(&mut self, frame: Vec<u8>, delay_ms: u64, priority: u8, now_ms: u64) -> MeshResult<()> {
        let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) else {
            warn!("TX queue full, dropping {} byte frame", frame.len());
            return Err(MeshError::QueueFull);
        };
        debug!("QUEUE {}B delay={}ms prio={}", frame.len(), delay_ms, priority);
        *slot = Some(QueuedPacket {
            frame,
            scheduled_ms: now_ms.saturating_add(delay_ms),
            priority,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Earliest scheduled time of any waiting frame
    pub fn next_due_ms(&self) -> Option<u64> {
        self.slots.iter().flatten().map(|p| p.scheduled_ms).min()
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueuedPacket> {
        self.slots.iter().flatten()
    }

    /// Index of the due slot with the lowest priority
    fn select(&self, now_ms: u64) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(p) = slot {
                if p.scheduled_ms > now_ms {
                    continue;
                }
                if best.map_or(true, |(_, prio)| p.priority < prio) {
                    best = Some((i, p.priority));
                }
            }
        }
        best.map(|(i, _)| i)
    }

    /// Transmit at most one due frame
    pub fn process<R: Radio + ?Sized>(&mut self, radio: &mut R, now_ms: u64) -> TxOutcome {
        if self.budget.in_silence(now_ms, self.config.silence_factor) {
            return TxOutcome::Silent;
        }

        let Some(idx) = self.select(now_ms) else {
            return TxOutcome::Idle;
        };
        let len = self.slots[idx].as_ref().map_or(0, |p| p.frame.len());
        let airtime = estimate_airtime(len);

        if !self.budget.allows(airtime, now_ms, &self.config) {
            let quiet = self
                .last_refusal_log_ms
                .is_some_and(|t| now_ms.saturating_sub(t) < self.config.refusal_log_interval_ms);
            if !quiet {
                warn!(
                    "Airtime budget exhausted ({}ms used of {}ms), deferring",
                    self.budget.used_ms(),
                    self.config.budget_ms()
                );
                self.last_refusal_log_ms = Some(now_ms);
            }
            return TxOutcome::Deferred;
        }

        let Some(packet) = self.slots[idx].take() else {
            return TxOutcome::Idle;
        };

        let result = radio.transmit(&packet.frame);
        if let Err(e) = radio.start_receive() {
            warn!("Failed to re-arm receiver: {}", e);
        }
        self.budget.record(airtime, now_ms);

        match result {
            Ok(()) => {
                debug!("TX {}B prio={} airtime={}ms", len, packet.priority, airtime);
                TxOutcome::Sent { len, airtime_ms: airtime }
            }
            Err(e) => {
                warn!("Transmit failed: {}", e);
                TxOutcome::Failed { len }
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new(AirtimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingRadio {
        sent: Vec<Vec<u8>>,
        fail: bool,
        rx_armed: usize,
    }

    impl Radio for RecordingRadio {
        fn transmit(&mut self, frame: &[u8]) -> MeshResult<()> {
            if self.fail {
                return Err(MeshError::Radio("busy".into()));
            }
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn start_receive(&mut self) -> MeshResult<()> {
            self.rx_armed += 1;
            Ok(())
        }
    }

    #[test]
    fn test_airtime_estimate() {
        assert_eq!(estimate_airtime(0), 15);
        assert_eq!(estimate_airtime(100), 615);
    }

    #[test]
    fn test_priority_order() {
        let mut q = TxQueue::default();
        let mut radio = RecordingRadio::default();
        q.enqueue(vec![9], 0, 9, 0).unwrap();
        q.enqueue(vec![3], 0, 3, 0).unwrap();

        assert!(matches!(q.process(&mut radio, 0), TxOutcome::Sent { len: 1, .. }));
        assert_eq!(radio.sent, vec![vec![3]]);
        assert_eq!(radio.rx_armed, 1);

        // Silence after the first frame: 21ms * 2
        assert_eq!(q.process(&mut radio, 41), TxOutcome::Silent);
        assert!(matches!(q.process(&mut radio, 42), TxOutcome::Sent { .. }));
        assert_eq!(radio.sent, vec![vec![3], vec![9]]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_equal_priority_scan_order() {
        let mut q = TxQueue::default();
        let mut radio = RecordingRadio::default();
        q.enqueue(vec![1], 0, 5, 0).unwrap();
        q.enqueue(vec![2], 0, 5, 0).unwrap();
        q.process(&mut radio, 0);
        assert_eq!(radio.sent, vec![vec![1]]);
    }

    #[test]
    fn test_scheduled_time_respected() {
        let mut q = TxQueue::default();
        let mut radio = RecordingRadio::default();
        q.enqueue(vec![1], 500, 1, 1000).unwrap();
        assert_eq!(q.next_due_ms(), Some(1500));
        assert_eq!(q.process(&mut radio, 1499), TxOutcome::Idle);
        assert!(matches!(q.process(&mut radio, 1500), TxOutcome::Sent { .. }));
    }

    #[test]
    fn test_queue_full_drops_newest() {
        let mut q = TxQueue::new(AirtimeConfig {
            queue_slots: 2,
            ..AirtimeConfig::default()
        });
        q.enqueue(vec![1], 0, 1, 0).unwrap();
        q.enqueue(vec![2], 0, 1, 0).unwrap();
        assert!(matches!(q.enqueue(vec![3], 0, 1, 0), Err(MeshError::QueueFull)));
        assert_eq!(q.len(), 2);
        assert!(q.pending().all(|p| p.frame != vec![3]));
    }

    #[test]
    fn test_budget_defers_not_drops() {
        let mut q = TxQueue::default();
        let mut radio = RecordingRadio::default();
        // 200 bytes = 1215ms each; budget is 3300ms per 10s window
        let mut now = 0;
        for _ in 0..4 {
            q.enqueue(vec![0; 200], 0, 1, now).unwrap();
        }
        let mut sent = 0;
        while now < 10_000 {
            if let TxOutcome::Sent { .. } = q.process(&mut radio, now) {
                sent += 1;
            }
            now += 10;
        }
        assert_eq!(sent, 2);
        assert!(q.budget().used_ms() <= q.config().budget_ms());
        assert_eq!(q.len(), 2);

        // New window: the deferred frames go out
        while now < 20_000 {
            q.process(&mut radio, now);
            now += 10;
        }
        assert_eq!(radio.sent.len(), 4);
        assert!(q.is_empty());
    }

    #[test]
    fn test_radio_failure_discards_and_continues() {
        let mut q = TxQueue::default();
        let mut radio = RecordingRadio {
            fail: true,
            ..RecordingRadio::default()
        };
        q.enqueue(vec![1, 2], 0, 1, 0).unwrap();
        assert_eq!(q.process(&mut radio, 0), TxOutcome::Failed { len: 2 });
        assert!(q.is_empty());
        assert_eq!(radio.rx_armed, 1);

        radio.fail = false;
        q.enqueue(vec![3], 0, 1, 100).unwrap();
        assert!(matches!(q.process(&mut radio, 100), TxOutcome::Sent { .. }));
    }
}
