//! Transfer State Machine
//!
//! One dedicated worker thread cycling INIT -> COLLECTING -> PREPARATION ->
//! TRANSMISSION until stopped. All waiting happens on a single wake signal,
//! always paired with the external alarm service so a lost notification can
//! never strand the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use event_dispatch::{EventDispatcher, Observer};
use sample_store::{RemovalOrder, SampleStore, StoredRecord};

use crate::collaborators::{
    AlarmService, ArchiveBuilder, Connectivity, ConnectivityEvent, Notifier, UploadError, Uploader,
};
use crate::gather::{GatherConfig, GatherDecision, GatheringController};
use crate::settings::{ConfigEvent, UplinkConfig};
use crate::signal::{WakeReason, WakeSignal};

/// Machine states; the cycle has no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    Collecting,
    Preparation,
    Transmission,
}

/// Everything the machine consumes. Collaborators are injected explicitly;
/// nothing reaches into process-wide state.
pub struct TransferDeps {
    pub store: Arc<SampleStore>,
    pub archive_builder: Arc<dyn ArchiveBuilder>,
    pub uploader: Arc<dyn Uploader>,
    pub connectivity: Arc<dyn Connectivity>,
    pub alarms: Arc<dyn AlarmService>,
    pub notifier: Arc<dyn Notifier>,
}

/// Starts transfer workers; see [`TransferHandle`] for the owner side.
pub struct TransferMachine;

impl TransferMachine {
    /// Spawn the worker thread and register wake observers on the host's
    /// connectivity and configuration dispatchers.
    pub fn start(
        config: UplinkConfig,
        deps: TransferDeps,
        connectivity_events: &EventDispatcher<ConnectivityEvent>,
        config_events: &EventDispatcher<ConfigEvent>,
    ) -> TransferHandle {
        let signal = Arc::new(WakeSignal::new());
        let controller = Arc::new(GatheringController::new(GatherConfig {
            min_sample_count: config.min_sample_count,
            min_frequency: Duration::from_millis(config.min_frequency_ms),
        }));
        let shared_config = Arc::new(RwLock::new(config));
        let transfer_active = Arc::new(AtomicBool::new(false));
        let state = Arc::new(RwLock::new(TransferState::Init));

        connectivity_events.register_observer(Arc::new(ConnectivityWake {
            signal: Arc::clone(&signal),
        }));
        config_events.register_observer(Arc::new(ConfigWake {
            signal: Arc::clone(&signal),
        }));

        let store = Arc::clone(&deps.store);
        let worker = Worker {
            config: Arc::clone(&shared_config),
            controller: Arc::clone(&controller),
            signal: Arc::clone(&signal),
            transfer_active: Arc::clone(&transfer_active),
            state: Arc::clone(&state),
            deps,
            working_set: Vec::new(),
            last_cycle_start: None,
            cycle_id: Uuid::new_v4(),
        };
        let thread = std::thread::spawn(move || worker.run());
        info!("transfer machine started");

        TransferHandle {
            signal,
            config: shared_config,
            controller,
            store,
            transfer_active,
            state,
            worker: Some(thread),
        }
    }
}

/// Owner-side handle: reconfigure, observe, and stop the worker.
pub struct TransferHandle {
    signal: Arc<WakeSignal>,
    config: Arc<RwLock<UplinkConfig>>,
    controller: Arc<GatheringController>,
    store: Arc<SampleStore>,
    transfer_active: Arc<AtomicBool>,
    state: Arc<RwLock<TransferState>>,
    worker: Option<JoinHandle<()>>,
}

impl TransferHandle {
    /// True while an upload attempt is in flight.
    pub fn is_transfer_active(&self) -> bool {
        self.transfer_active.load(Ordering::Acquire)
    }

    pub fn current_state(&self) -> TransferState {
        *self.state.read()
    }

    /// Entry point for the host's platform alarm callback.
    pub fn alarm_fired(&self) {
        self.signal.notify(WakeReason::Alarm);
    }

    /// Apply a new configuration. Takes effect at the next evaluation and
    /// wakes any wait computed from the old values.
    pub fn update_config(&self, new: UplinkConfig) {
        let rate_changed;
        let store_resized;
        {
            let mut current = self.config.write();
            rate_changed = new.min_frequency_ms != current.min_frequency_ms
                || new.min_sample_count != current.min_sample_count
                || new.max_sample_count != current.max_sample_count;
            store_resized = new.store.max_size_bytes != current.store.max_size_bytes;
            *current = new.clone();
        }
        self.controller.update(GatherConfig {
            min_sample_count: new.min_sample_count,
            min_frequency: Duration::from_millis(new.min_frequency_ms),
        });
        if store_resized {
            if let Err(err) = self.store.set_max_size(new.store.max_size_bytes) {
                warn!(error = %err, "store resize failed");
            }
        }
        if rate_changed {
            self.signal.notify(WakeReason::SampleRateChanged);
        } else {
            self.signal.notify(WakeReason::ConfigChanged);
        }
    }

    /// Stop the worker and join it. A non-empty working set gets one final
    /// archive build so samples already removed from the store are not
    /// silently lost.
    pub fn stop(mut self) {
        self.signal.notify(WakeReason::Stop);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("transfer worker panicked");
            }
        }
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.signal.notify(WakeReason::Stop);
            let _ = worker.join();
        }
    }
}

struct ConnectivityWake {
    signal: Arc<WakeSignal>,
}

impl Observer<ConnectivityEvent> for ConnectivityWake {
    fn on_event(&self, event: &ConnectivityEvent) {
        if *event == ConnectivityEvent::Restored {
            self.signal.notify(WakeReason::ConnectivityRestored);
        }
    }
}

struct ConfigWake {
    signal: Arc<WakeSignal>,
}

impl Observer<ConfigEvent> for ConfigWake {
    fn on_event(&self, event: &ConfigEvent) {
        let reason = match event {
            ConfigEvent::SampleRateChanged => WakeReason::SampleRateChanged,
            ConfigEvent::EndpointChanged | ConfigEvent::StoreResized => WakeReason::ConfigChanged,
        };
        self.signal.notify(reason);
    }
}

/// RAII transfer-active marker; the flag drops with the guard even on an
/// early return.
struct TransferGuard {
    flag: Arc<AtomicBool>,
}

impl TransferGuard {
    fn hold(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Release);
        Self {
            flag: Arc::clone(flag),
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct Worker {
    config: Arc<RwLock<UplinkConfig>>,
    controller: Arc<GatheringController>,
    signal: Arc<WakeSignal>,
    transfer_active: Arc<AtomicBool>,
    state: Arc<RwLock<TransferState>>,
    deps: TransferDeps,
    working_set: Vec<StoredRecord>,
    last_cycle_start: Option<Instant>,
    cycle_id: Uuid,
}

impl Worker {
    fn run(mut self) {
        info!("transfer worker started");
        let mut current = TransferState::Init;
        loop {
            let next = match current {
                TransferState::Init => self.run_init(),
                TransferState::Collecting => self.run_collecting(),
                TransferState::Preparation => self.run_preparation(),
                TransferState::Transmission => self.run_transmission(),
            };
            let Some(next) = next else {
                break;
            };
            if next != current {
                debug!(cycle = %self.cycle_id, from = ?current, to = ?next, "state transition");
                *self.state.write() = next;
            }
            current = next;
        }
        self.flush_working_set();
        info!("transfer worker stopped");
    }

    /// Timed wait paired with the external alarm so the thread resumes even
    /// if the in-process signal is lost.
    fn wait(&self, timeout: Duration) -> WakeReason {
        self.deps.alarms.set_alarm(timeout);
        let reason = self.signal.wait_timeout(timeout);
        self.deps.alarms.cancel_alarm();
        reason
    }

    fn run_init(&mut self) -> Option<TransferState> {
        let min_frequency = Duration::from_millis(self.config.read().min_frequency_ms);
        if let Some(last_start) = self.last_cycle_start {
            let elapsed = last_start.elapsed();
            if elapsed < min_frequency {
                return match self.wait(min_frequency - elapsed) {
                    WakeReason::Stop => None,
                    // A frequency change (or any other wake) falls through
                    // to a fresh computation against the monotonic clock.
                    _ => Some(TransferState::Init),
                };
            }
        }
        self.last_cycle_start = Some(Instant::now());
        self.cycle_id = Uuid::new_v4();
        debug!(cycle = %self.cycle_id, "cycle started");
        Some(TransferState::Collecting)
    }

    fn run_collecting(&mut self) -> Option<TransferState> {
        if self.deps.archive_builder.has_archive() {
            // An archive from an interrupted cycle is never dropped; it goes
            // out before anything new is built.
            info!(cycle = %self.cycle_id, "unsent archive found, resuming transmission");
            return Some(TransferState::Transmission);
        }

        let retry = Duration::from_millis(self.config.read().preparation_retry_ms);
        let pending = match self.deps.store.record_count() {
            Ok(count) => count,
            Err(err) => {
                warn!(cycle = %self.cycle_id, error = %err, "record count failed");
                return match self.wait(retry) {
                    WakeReason::Stop => None,
                    _ => Some(TransferState::Collecting),
                };
            }
        };

        match self.controller.decision(pending) {
            GatherDecision::Ready => {
                let max = self.config.read().max_sample_count;
                match self
                    .deps
                    .store
                    .remove_batch(max, RemovalOrder::PriorityThenAge)
                {
                    Ok(batch) if batch.is_empty() => match self.wait(retry) {
                        WakeReason::Stop => None,
                        _ => Some(TransferState::Collecting),
                    },
                    Ok(batch) => {
                        info!(cycle = %self.cycle_id, count = batch.len(), "batch collected");
                        self.working_set = batch;
                        Some(TransferState::Preparation)
                    }
                    Err(err) => {
                        warn!(cycle = %self.cycle_id, error = %err, "batch removal failed");
                        match self.wait(retry) {
                            WakeReason::Stop => None,
                            _ => Some(TransferState::Collecting),
                        }
                    }
                }
            }
            GatherDecision::Wait(wait) => {
                debug!(
                    cycle = %self.cycle_id,
                    pending,
                    wait_ms = wait.as_millis() as u64,
                    "not enough samples"
                );
                match self.wait(wait) {
                    WakeReason::Stop => None,
                    // Sample-rate changes and timer fires alike trigger a
                    // fresh evaluation.
                    _ => Some(TransferState::Collecting),
                }
            }
        }
    }

    fn run_preparation(&mut self) -> Option<TransferState> {
        if self.working_set.is_empty() {
            return Some(TransferState::Transmission);
        }
        match self.deps.archive_builder.create_archive(&self.working_set) {
            Ok(()) => {
                debug!(
                    cycle = %self.cycle_id,
                    count = self.working_set.len(),
                    "archive built"
                );
                self.working_set.clear();
                Some(TransferState::Transmission)
            }
            Err(err) => {
                // The batch is already out of the durable store; keep it and
                // retry on the next tick.
                warn!(cycle = %self.cycle_id, error = %err, "archive build failed, retrying");
                let retry = Duration::from_millis(self.config.read().preparation_retry_ms);
                match self.wait(retry) {
                    WakeReason::Stop => None,
                    _ => Some(TransferState::Preparation),
                }
            }
        }
    }

    fn run_transmission(&mut self) -> Option<TransferState> {
        let Some(path) = self.deps.archive_builder.current_archive_path() else {
            warn!(cycle = %self.cycle_id, "no archive to transmit");
            return Some(TransferState::Init);
        };

        let result = {
            let _guard = TransferGuard::hold(&self.transfer_active);
            self.deps.uploader.upload_file(&path)
        };

        match result {
            Ok(()) => {
                info!(cycle = %self.cycle_id, path = %path.display(), "archive uploaded");
                self.deps.archive_builder.clean_up(true);
                self.deps.notifier.clear();
                self.last_cycle_start = Some(Instant::now());
                Some(TransferState::Init)
            }
            Err(UploadError::NoConnectivity) => self.wait_for_connectivity(),
            Err(UploadError::Protocol(reason)) => self.wait_for_config_fix(&reason),
        }
    }

    /// Block until connectivity returns or the fallback alarm fires, then
    /// retry the transmission either way.
    fn wait_for_connectivity(&mut self) -> Option<TransferState> {
        if self.deps.connectivity.is_connected() {
            // Transient blip; the network is already back.
            return Some(TransferState::Transmission);
        }
        self.deps.notifier.show_waiting_for_network();
        let fallback = Duration::from_millis(self.config.read().connectivity_fallback_ms);
        info!(
            cycle = %self.cycle_id,
            fallback_ms = fallback.as_millis() as u64,
            "waiting for connectivity"
        );
        let deadline = Instant::now() + fallback;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.wait(remaining) {
                WakeReason::Stop => {
                    self.deps.notifier.clear();
                    return None;
                }
                WakeReason::ConnectivityRestored | WakeReason::Timeout | WakeReason::Alarm => break,
                // Configuration noise does not end the connectivity wait.
                _ => {}
            }
        }
        self.deps.notifier.clear();
        Some(TransferState::Transmission)
    }

    /// Block at most the configured wait for a configuration change, then
    /// retry regardless so a permanently bad endpoint cannot stall the
    /// pipeline forever.
    fn wait_for_config_fix(&mut self, reason: &str) -> Option<TransferState> {
        let max_wait = Duration::from_millis(self.config.read().protocol_retry_wait_ms);
        warn!(
            cycle = %self.cycle_id,
            reason,
            max_wait_ms = max_wait.as_millis() as u64,
            "protocol error, waiting for configuration change"
        );
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.wait(remaining) {
                WakeReason::Stop => {
                    self.deps.notifier.clear();
                    return None;
                }
                WakeReason::ConfigChanged
                | WakeReason::SampleRateChanged
                | WakeReason::Timeout
                | WakeReason::Alarm => break,
                _ => {}
            }
        }
        self.deps.notifier.clear();
        Some(TransferState::Transmission)
    }

    /// Samples in the working set are already out of the durable store; one
    /// last build attempt is all that stands between them and loss.
    fn flush_working_set(&mut self) {
        if self.working_set.is_empty() {
            return;
        }
        match self.deps.archive_builder.create_archive(&self.working_set) {
            Ok(()) => {
                info!(
                    count = self.working_set.len(),
                    "working set archived during shutdown"
                );
                self.working_set.clear();
            }
            Err(err) => {
                error!(
                    lost_samples = self.working_set.len(),
                    error = %err,
                    "samples lost: archive build failed during shutdown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ArchiveError;
    use parking_lot::Mutex;
    use sample_store::{Sample, SamplePayload, StoreConfig};
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    struct MockArchiveBuilder {
        path: PathBuf,
        archive: Mutex<Option<usize>>,
        create_attempts: AtomicUsize,
        failures_remaining: AtomicUsize,
        built_counts: Mutex<Vec<usize>>,
    }

    impl MockArchiveBuilder {
        fn new(path: PathBuf) -> Self {
            Self {
                path,
                archive: Mutex::new(None),
                create_attempts: AtomicUsize::new(0),
                failures_remaining: AtomicUsize::new(0),
                built_counts: Mutex::new(Vec::new()),
            }
        }

        fn successful_builds(&self) -> usize {
            self.built_counts.lock().len()
        }
    }

    impl ArchiveBuilder for MockArchiveBuilder {
        fn create_archive(&self, records: &[StoredRecord]) -> Result<(), ArchiveError> {
            self.create_attempts.fetch_add(1, Ordering::SeqCst);
            let failures = self.failures_remaining.load(Ordering::SeqCst);
            if failures > 0 {
                self.failures_remaining.store(failures - 1, Ordering::SeqCst);
                return Err(ArchiveError("spool unavailable".to_string()));
            }
            *self.archive.lock() = Some(records.len());
            self.built_counts.lock().push(records.len());
            Ok(())
        }

        fn has_archive(&self) -> bool {
            self.archive.lock().is_some()
        }

        fn current_archive_path(&self) -> Option<PathBuf> {
            self.archive.lock().map(|_| self.path.clone())
        }

        fn clean_up(&self, _after_success: bool) {
            *self.archive.lock() = None;
        }
    }

    struct MockUploader {
        failures: Mutex<VecDeque<UploadError>>,
        attempts: Mutex<Vec<Instant>>,
        successes: AtomicUsize,
        delay: Duration,
    }

    impl MockUploader {
        fn new() -> Self {
            Self {
                failures: Mutex::new(VecDeque::new()),
                attempts: Mutex::new(Vec::new()),
                successes: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn failing_with(failures: Vec<UploadError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                ..Self::new()
            }
        }

        fn uploads(&self) -> usize {
            self.successes.load(Ordering::SeqCst)
        }
    }

    impl Uploader for MockUploader {
        fn upload_file(&self, _path: &Path) -> Result<(), UploadError> {
            self.attempts.lock().push(Instant::now());
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockConnectivity {
        connected: AtomicBool,
    }

    impl Connectivity for MockConnectivity {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct NoopAlarms;

    impl AlarmService for NoopAlarms {
        fn set_alarm(&self, _delay: Duration) {}
        fn cancel_alarm(&self) {}
    }

    struct MockNotifier {
        shows: AtomicUsize,
        clears: AtomicUsize,
    }

    impl Notifier for MockNotifier {
        fn show_waiting_for_network(&self) {
            self.shows.fetch_add(1, Ordering::SeqCst);
        }
        fn clear(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<SampleStore>,
        builder: Arc<MockArchiveBuilder>,
        uploader: Arc<MockUploader>,
        connectivity: Arc<MockConnectivity>,
        notifier: Arc<MockNotifier>,
        connectivity_events: EventDispatcher<ConnectivityEvent>,
        config_events: EventDispatcher<ConfigEvent>,
    }

    impl Harness {
        fn new(uploader: MockUploader) -> Self {
            init_logging();
            let dir = TempDir::new().expect("tempdir");
            let store = Arc::new(SampleStore::new(StoreConfig {
                path: dir.path().join("samples.db"),
                ..StoreConfig::default()
            }));
            let builder = Arc::new(MockArchiveBuilder::new(dir.path().join("batch.archive")));
            Self {
                _dir: dir,
                store,
                builder,
                uploader: Arc::new(uploader),
                connectivity: Arc::new(MockConnectivity {
                    connected: AtomicBool::new(true),
                }),
                notifier: Arc::new(MockNotifier {
                    shows: AtomicUsize::new(0),
                    clears: AtomicUsize::new(0),
                }),
                connectivity_events: EventDispatcher::new("connectivity"),
                config_events: EventDispatcher::new("config"),
            }
        }

        fn config(&self) -> UplinkConfig {
            UplinkConfig {
                min_frequency_ms: 10,
                min_sample_count: 1,
                max_sample_count: 100,
                preparation_retry_ms: 25,
                connectivity_fallback_ms: 2_000,
                protocol_retry_wait_ms: 150,
                endpoint: "https://ingest.example.com/v1".to_string(),
                ..UplinkConfig::default()
            }
        }

        fn start(&self, config: UplinkConfig) -> TransferHandle {
            TransferMachine::start(
                config,
                TransferDeps {
                    store: Arc::clone(&self.store),
                    archive_builder: self.builder.clone(),
                    uploader: self.uploader.clone(),
                    connectivity: self.connectivity.clone(),
                    alarms: Arc::new(NoopAlarms),
                    notifier: self.notifier.clone(),
                },
                &self.connectivity_events,
                &self.config_events,
            )
        }

        fn insert_samples(&self, count: usize) {
            let samples: Vec<Sample> = (0..count)
                .map(|i| Sample {
                    device_id: "imu-1".to_string(),
                    timestamp_ms: i as i64,
                    time_synced: Some(true),
                    priority: (i % 3) as u8,
                    payload: SamplePayload {
                        type_tag: "imu-frame".to_string(),
                        data: vec![1, 2, 3, 4],
                    },
                    location: None,
                })
                .collect();
            self.store.insert_batch(&samples).unwrap();
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_cycle_collects_builds_and_uploads() {
        let harness = Harness::new(MockUploader::new());
        harness.insert_samples(3);

        let handle = harness.start(harness.config());
        assert!(wait_until(Duration::from_secs(3), || harness.uploader.uploads() >= 1));

        assert_eq!(*harness.builder.built_counts.lock(), vec![3]);
        assert_eq!(harness.store.record_count().unwrap(), 0);
        assert!(!harness.builder.has_archive());
        handle.stop();
    }

    #[test]
    fn test_unsent_archive_transmits_before_new_build() {
        let harness = Harness::new(MockUploader::new());
        // Archive left over from an interrupted cycle; store is empty.
        *harness.builder.archive.lock() = Some(4);

        let handle = harness.start(harness.config());
        assert!(wait_until(Duration::from_secs(3), || harness.uploader.uploads() >= 1));

        // Transmitted without building anything new.
        assert_eq!(harness.builder.successful_builds(), 0);
        handle.stop();
    }

    #[test]
    fn test_connectivity_restored_beats_fallback() {
        let harness = Harness::new(MockUploader::failing_with(vec![UploadError::NoConnectivity]));
        harness.connectivity.connected.store(false, Ordering::SeqCst);
        harness.insert_samples(2);

        let handle = harness.start(harness.config());
        assert!(wait_until(Duration::from_secs(3), || {
            harness.notifier.shows.load(Ordering::SeqCst) >= 1
        }));

        std::thread::sleep(Duration::from_millis(50));
        harness.connectivity.connected.store(true, Ordering::SeqCst);
        let restored_at = Instant::now();
        harness
            .connectivity_events
            .enqueue(ConnectivityEvent::Restored);

        // Retry rides the restoration event, far ahead of the 2s fallback.
        assert!(wait_until(Duration::from_millis(500), || {
            harness.uploader.uploads() >= 1
        }));
        assert!(restored_at.elapsed() < Duration::from_millis(1_000));
        assert!(harness.notifier.clears.load(Ordering::SeqCst) >= 1);
        handle.stop();
    }

    #[test]
    fn test_protocol_error_retries_after_bounded_wait() {
        let harness = Harness::new(MockUploader::failing_with(vec![UploadError::Protocol(
            "401 unauthorized".to_string(),
        )]));
        harness.insert_samples(1);

        let handle = harness.start(harness.config());
        // Retries even though no configuration change ever arrives.
        assert!(wait_until(Duration::from_secs(3), || harness.uploader.uploads() >= 1));

        let attempts = harness.uploader.attempts.lock();
        assert!(attempts.len() >= 2);
        let gap = attempts[1] - attempts[0];
        assert!(gap >= Duration::from_millis(100), "retried after {gap:?}");
        handle.stop();
    }

    #[test]
    fn test_config_change_cuts_protocol_wait_short() {
        let harness = Harness::new(MockUploader::failing_with(vec![UploadError::Protocol(
            "bad endpoint".to_string(),
        )]));
        harness.insert_samples(1);

        let mut config = harness.config();
        config.protocol_retry_wait_ms = 10_000;
        let handle = harness.start(config);

        assert!(wait_until(Duration::from_secs(3), || {
            !harness.uploader.attempts.lock().is_empty()
        }));
        let mut fixed = harness.config();
        fixed.protocol_retry_wait_ms = 10_000;
        fixed.endpoint = "https://ingest.example.com/v2".to_string();
        handle.update_config(fixed);

        // Wakes on the change instead of sitting out the 10s bound.
        assert!(wait_until(Duration::from_secs(2), || harness.uploader.uploads() >= 1));
        handle.stop();
    }

    #[test]
    fn test_archive_failure_keeps_working_set() {
        let harness = Harness::new(MockUploader::new());
        harness.builder.failures_remaining.store(1, Ordering::SeqCst);
        harness.insert_samples(3);

        let handle = harness.start(harness.config());
        assert!(wait_until(Duration::from_secs(3), || harness.uploader.uploads() >= 1));

        // The same three samples made it into the retried archive.
        assert_eq!(*harness.builder.built_counts.lock(), vec![3]);
        assert!(harness.builder.create_attempts.load(Ordering::SeqCst) >= 2);
        handle.stop();
    }

    #[test]
    fn test_stop_flushes_working_set() {
        let harness = Harness::new(MockUploader::new());
        harness.builder.failures_remaining.store(1, Ordering::SeqCst);
        harness.insert_samples(2);

        let mut config = harness.config();
        config.preparation_retry_ms = 60_000;
        let handle = harness.start(config);

        // First build fails, the worker parks on the long retry wait.
        assert!(wait_until(Duration::from_secs(3), || {
            harness.builder.create_attempts.load(Ordering::SeqCst) >= 1
        }));
        handle.stop();

        // Shutdown flushed the working set into an archive.
        assert_eq!(*harness.builder.built_counts.lock(), vec![2]);
        assert!(harness.builder.has_archive());
        assert_eq!(harness.uploader.uploads(), 0);
    }

    #[test]
    fn test_liveness_across_repeated_cycles() {
        let harness = Harness::new(MockUploader::new());
        harness.insert_samples(5);

        let mut config = harness.config();
        config.max_sample_count = 2;
        config.min_frequency_ms = 20;
        let handle = harness.start(config);

        // 2 + 2 + 1: three full cycles back to INIT without deadlock.
        assert!(wait_until(Duration::from_secs(5), || harness.uploader.uploads() >= 3));
        assert_eq!(*harness.builder.built_counts.lock(), vec![2, 2, 1]);
        assert_eq!(harness.store.record_count().unwrap(), 0);
        handle.stop();
    }

    #[test]
    fn test_sample_rate_change_wakes_collector() {
        let harness = Harness::new(MockUploader::new());
        harness.insert_samples(1);

        let mut config = harness.config();
        config.min_sample_count = 100;
        config.min_frequency_ms = 60_000;
        let handle = harness.start(config);

        // One pending sample out of 100: the collector settles into a long
        // wait scaled from min_frequency.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(harness.uploader.uploads(), 0);

        let mut lowered = harness.config();
        lowered.min_sample_count = 1;
        lowered.min_frequency_ms = 60_000;
        handle.update_config(lowered);

        assert!(wait_until(Duration::from_secs(2), || harness.uploader.uploads() >= 1));
        handle.stop();
    }

    #[test]
    fn test_transfer_active_only_during_upload() {
        let harness = Harness::new(MockUploader {
            delay: Duration::from_millis(200),
            ..MockUploader::new()
        });
        harness.insert_samples(1);

        let handle = harness.start(harness.config());
        assert!(wait_until(Duration::from_secs(3), || handle.is_transfer_active()));
        assert!(wait_until(Duration::from_secs(3), || {
            !handle.is_transfer_active() && harness.uploader.uploads() >= 1
        }));
        handle.stop();
    }
}
