//! Sample Model

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Opaque producer-serialized payload plus the type tag the receiving side
/// uses to reconstruct it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePayload {
    pub type_tag: String,
    pub data: Vec<u8>,
}

/// One sensor reading plus metadata, as handed to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Originating sensor/device.
    pub device_id: String,
    /// Device-local or corrected epoch millis.
    pub timestamp_ms: i64,
    /// True if the timestamp was captured under a trusted clock.
    pub time_synced: Option<bool>,
    /// Lower value = higher transmission priority; 0 is highest.
    pub priority: u8,
    pub payload: SamplePayload,
    /// Serialized geo-location attached at capture time.
    pub location: Option<String>,
}

impl Sample {
    /// Create a sample stamped with the current wall-clock time.
    pub fn captured_now(
        device_id: impl Into<String>,
        priority: u8,
        payload: SamplePayload,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            time_synced: None,
            priority,
            payload,
            location: None,
        }
    }
}

/// Persisted form, owned exclusively by the store. `row_id` is assigned on
/// insert, strictly increasing in insertion order and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub row_id: i64,
    pub device_id: String,
    pub timestamp_ms: i64,
    pub time_synced: Option<bool>,
    pub priority: u8,
    pub payload: SamplePayload,
    pub location: Option<String>,
}

/// Total order a removal batch is returned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOrder {
    /// Priority ascending, ties broken by timestamp ascending.
    PriorityThenAge,
    /// Timestamp ascending only.
    AgeOnly,
}

impl RemovalOrder {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            RemovalOrder::PriorityThenAge => "priority ASC, timestamp_ms ASC, id ASC",
            RemovalOrder::AgeOnly => "timestamp_ms ASC, id ASC",
        }
    }
}
