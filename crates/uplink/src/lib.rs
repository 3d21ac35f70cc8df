//! Uplink Pipeline
//!
//! Drains the sample store into archives and uploads them under constrained,
//! intermittent connectivity: gathering control, the transfer state machine,
//! and the collaborator interfaces it consumes.

mod collaborators;
mod gather;
mod machine;
mod settings;
mod signal;

pub use collaborators::{
    AlarmService, ArchiveBuilder, ArchiveError, Connectivity, ConnectivityEvent, Notifier,
    UploadError, Uploader,
};
pub use gather::{GatherConfig, GatherDecision, GatheringController};
pub use machine::{TransferDeps, TransferHandle, TransferMachine, TransferState};
pub use settings::{ConfigEvent, UplinkConfig};
pub use signal::{WakeReason, WakeSignal};

use thiserror::Error;

/// Uplink errors
#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
