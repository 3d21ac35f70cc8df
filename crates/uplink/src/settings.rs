//! Runtime Settings

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use sample_store::{EvictionConfig, StoreConfig};

use crate::UplinkError;

/// Uplink configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Minimum time between cycle starts (ms, default hourly).
    pub min_frequency_ms: u64,
    /// Samples required before a transfer cycle is worthwhile.
    pub min_sample_count: u64,
    /// Upper bound on one removal batch.
    pub max_sample_count: usize,
    /// Wait before retrying a failed archive build (ms).
    pub preparation_retry_ms: u64,
    /// Fallback wake-up while waiting for connectivity (ms, default 6 min).
    pub connectivity_fallback_ms: u64,
    /// Bounded wait after a protocol error (ms, default 5 min).
    pub protocol_retry_wait_ms: u64,
    /// Remote endpoint the uploader targets.
    pub endpoint: String,
    /// Sample store tuning.
    pub store: StoreConfig,
    /// Eviction tuning.
    pub eviction: EvictionConfig,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            min_frequency_ms: 3_600_000,
            min_sample_count: 50,
            max_sample_count: 1_000,
            preparation_retry_ms: 30_000,
            connectivity_fallback_ms: 360_000,
            protocol_retry_wait_ms: 300_000,
            endpoint: String::new(),
            store: StoreConfig::default(),
            eviction: EvictionConfig::default(),
        }
    }
}

impl UplinkConfig {
    /// Load from an optional TOML file layered under `UPLINK_`-prefixed
    /// environment variables; unset fields keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, UplinkError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("UPLINK").separator("__"))
            .build()?;
        let loaded: Self = settings.try_deserialize()?;
        info!(
            min_frequency_ms = loaded.min_frequency_ms,
            min_sample_count = loaded.min_sample_count,
            endpoint = %loaded.endpoint,
            "uplink configuration loaded"
        );
        Ok(loaded)
    }
}

/// Runtime configuration change fanned out to running components. Every
/// change takes effect at the next evaluation and wakes any blocked wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    /// Frequency or batch thresholds changed; waits must be recomputed.
    SampleRateChanged,
    /// Endpoint or credentials changed.
    EndpointChanged,
    /// Store size cap changed.
    StoreResized,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = UplinkConfig::default();
        assert_eq!(config.min_frequency_ms, 3_600_000);
        assert_eq!(config.connectivity_fallback_ms, 360_000);
        assert_eq!(config.protocol_retry_wait_ms, 300_000);
        assert_eq!(config.store.chunk_size, 200);
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("uplink.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "min_sample_count = 5\nendpoint = \"https://ingest.example.com/v1\"\n\n[store]\nmax_size_bytes = 1048576"
        )
        .unwrap();

        let config = UplinkConfig::load(Some(&path)).unwrap();
        assert_eq!(config.min_sample_count, 5);
        assert_eq!(config.endpoint, "https://ingest.example.com/v1");
        assert_eq!(config.store.max_size_bytes, 1_048_576);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_sample_count, 1_000);
    }
}
