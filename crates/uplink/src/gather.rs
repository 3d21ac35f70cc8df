//! Gathering Control
//!
//! Pure decision logic: is the pending batch large enough to justify a
//! transfer cycle, and if not, how long to wait before re-checking.

use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

/// Thresholds the decision is computed from.
#[derive(Debug, Clone, Copy)]
pub struct GatherConfig {
    pub min_sample_count: u64,
    pub min_frequency: Duration,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherDecision {
    /// Enough samples are pending; start the cycle now.
    Ready,
    /// Re-check after this long; the closer the batch is to ready, the
    /// sooner the re-check.
    Wait(Duration),
}

/// Computes gather decisions from the current pending count. No I/O; the
/// caller supplies the count and owns all waiting.
pub struct GatheringController {
    config: RwLock<GatherConfig>,
}

impl GatheringController {
    pub fn new(config: GatherConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Swap thresholds. Callers re-evaluate any wait in progress instead of
    /// honoring it to completion.
    pub fn update(&self, config: GatherConfig) {
        debug!(
            min_sample_count = config.min_sample_count,
            min_frequency_ms = config.min_frequency.as_millis() as u64,
            "gathering thresholds updated"
        );
        *self.config.write() = config;
    }

    pub fn decision(&self, pending: u64) -> GatherDecision {
        let config = *self.config.read();
        if pending >= config.min_sample_count {
            return GatherDecision::Ready;
        }
        let missing = config.min_sample_count - pending;
        let scaled = config
            .min_frequency
            .mul_f64(missing as f64 / config.min_sample_count as f64);
        let floor = Duration::from_secs(1).min(config.min_frequency);
        GatherDecision::Wait(scaled.clamp(floor, config.min_frequency))
    }
}
