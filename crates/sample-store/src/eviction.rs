//! Eviction Policies

use serde::Deserialize;
use tracing::{debug, info};

use crate::sample::Sample;
use crate::store::SampleStore;
use crate::StoreError;

/// Which records go first when the store is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Delete the oldest records regardless of priority.
    OldestFirst,
    /// Delete the oldest records of the least important priority tier first,
    /// spilling into more important tiers only if the count is not yet
    /// satisfied.
    LowestPriorityFirst,
}

impl EvictionPolicy {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            // Numerically larger priority = less important, so the worst
            // tier sorts first and the ordering spills upward on its own.
            EvictionPolicy::LowestPriorityFirst => "priority DESC, timestamp_ms ASC, id ASC",
            EvictionPolicy::OldestFirst => "timestamp_ms ASC, id ASC",
        }
    }
}

/// Eviction configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub policy: EvictionPolicy,
    /// Records deleted per eviction run.
    pub batch_size: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: EvictionPolicy::LowestPriorityFirst,
            batch_size: 100,
        }
    }
}

/// Runs the configured eviction policy against a store at capacity.
pub struct Evictor {
    config: EvictionConfig,
}

impl Evictor {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    /// Delete up to `batch_size` records. A store below capacity is left
    /// untouched; deleting zero records is success, and re-running after a
    /// partial failure never double-deletes (each run re-selects live rows).
    pub fn evict(&self, store: &SampleStore) -> Result<u64, StoreError> {
        if !store.is_at_capacity()? {
            debug!("store below capacity, nothing to evict");
            return Ok(0);
        }
        let deleted = store.delete_batch(self.config.batch_size, self.config.policy)?;
        if deleted > 0 {
            info!(
                deleted,
                policy = ?self.config.policy,
                "evicted stored samples (data loss)"
            );
        }
        Ok(deleted)
    }

    /// Insert a batch, evicting and retrying when the store is full.
    ///
    /// Repeats evict-then-retry until the insert lands or eviction frees
    /// nothing more, in which case the final `Full` is surfaced and the
    /// caller still owns the samples.
    pub fn insert_evicting(
        &self,
        store: &SampleStore,
        samples: &[Sample],
    ) -> Result<(), StoreError> {
        loop {
            match store.insert_batch(samples) {
                Err(StoreError::Full) => {
                    let deleted = store.delete_batch(self.config.batch_size, self.config.policy)?;
                    if deleted == 0 {
                        return Err(StoreError::Full);
                    }
                    info!(
                        deleted,
                        policy = ?self.config.policy,
                        "evicted stored samples to admit new batch (data loss)"
                    );
                }
                other => return other,
            }
        }
    }
}
