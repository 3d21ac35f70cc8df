//! Collaborator Interfaces
//!
//! The transfer cycle consumes these narrow interfaces; the archive codec,
//! network transport, platform alarms, and notification surface live outside
//! this crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use sample_store::StoredRecord;

/// Archive construction failed; the batch is retained and retried.
#[derive(Debug, Error)]
#[error("archive build failed: {0}")]
pub struct ArchiveError(pub String);

/// Upload failure classification driving the retry strategy.
#[derive(Debug, Error)]
pub enum UploadError {
    /// No usable network; wait for restoration or the fallback alarm.
    #[error("no connectivity")]
    NoConnectivity,
    /// Endpoint, authentication, or protocol problem; wait for a
    /// configuration fix, bounded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Packages a removed batch into an upload-ready archive.
pub trait ArchiveBuilder: Send + Sync {
    fn create_archive(&self, records: &[StoredRecord]) -> Result<(), ArchiveError>;
    /// True if an archive, possibly from an interrupted cycle, awaits upload.
    fn has_archive(&self) -> bool;
    fn current_archive_path(&self) -> Option<PathBuf>;
    /// Discard archive state; `after_success` distinguishes a transmitted
    /// archive from an abandoned one.
    fn clean_up(&self, after_success: bool);
}

/// Uploads a finished archive to the remote endpoint.
pub trait Uploader: Send + Sync {
    fn upload_file(&self, path: &Path) -> Result<(), UploadError>;
}

/// Connectivity change fanned out by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Restored,
    Lost,
}

/// Synchronous connectivity query, alongside the event stream.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// OS-level alarm that delivers a wake-up even across process suspension,
/// backing every timed wait in the transfer cycle.
pub trait AlarmService: Send + Sync {
    fn set_alarm(&self, delay: Duration);
    fn cancel_alarm(&self);
}

/// User-facing waiting notification; never on the failure-critical path.
pub trait Notifier: Send + Sync {
    fn show_waiting_for_network(&self);
    fn clear(&self);
}
