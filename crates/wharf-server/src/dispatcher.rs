//! Dispatcher
//!
//! One dispatcher task per destination type. Each cycle it walks the active
//! warehouses of its type and, per `(source, destination)` pair:
//!
//! 1. skips pairs already claimed in-progress,
//! 2. runs crash recovery once per interrupted destination,
//! 3. re-enqueues pending (non-terminal) uploads, aborting those whose
//!    retries are exhausted,
//! 4. otherwise creates new uploads from pending staging files, gated by
//!    the per-destination upload frequency.
//!
//! The shared maps (in-progress claims, recovery flags, last-exec times,
//! worker channels, active-worker count) live in one [`OrchestratorState`]
//! value with their locks co-located.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, WarehouseAdapter};
use crate::config::WarehouseConfig;
use crate::job::UploadJob;
use crate::journal::{Journal, JournalError, JournalResult};
use crate::model::{DestinationType, StagingFile, Upload, Warehouse};
use crate::state::UploadState;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ActiveWorkers {
    current: usize,
    high_water: usize,
}

/// Process-wide orchestration state shared by dispatchers, workers, and
/// the control-plane subscriber.
#[derive(Default)]
pub struct OrchestratorState {
    warehouses: Mutex<HashMap<DestinationType, Vec<Warehouse>>>,
    in_progress: Mutex<HashSet<String>>,
    in_recovery: Mutex<HashSet<String>>,
    last_exec: Mutex<HashMap<String, DateTime<Utc>>>,
    workers: Mutex<HashMap<String, mpsc::Sender<Vec<UploadJob>>>>,
    active: Mutex<ActiveWorkers>,
}

impl OrchestratorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active warehouse list for one destination type.
    pub fn set_warehouses(&self, destination_type: DestinationType, warehouses: Vec<Warehouse>) {
        lock(&self.warehouses).insert(destination_type, warehouses);
    }

    pub fn warehouses_for(&self, destination_type: DestinationType) -> Vec<Warehouse> {
        lock(&self.warehouses)
            .get(&destination_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_in_progress(&self, connection_key: &str, in_progress: bool) {
        let mut claims = lock(&self.in_progress);
        if in_progress {
            claims.insert(connection_key.to_string());
        } else {
            claims.remove(connection_key);
        }
    }

    pub fn is_in_progress(&self, connection_key: &str) -> bool {
        lock(&self.in_progress).contains(connection_key)
    }

    pub fn mark_recovery(&self, destination_id: &str) {
        lock(&self.in_recovery).insert(destination_id.to_string());
    }

    pub fn needs_recovery(&self, destination_id: &str) -> bool {
        lock(&self.in_recovery).contains(destination_id)
    }

    pub fn clear_recovery(&self, destination_id: &str) {
        lock(&self.in_recovery).remove(destination_id);
    }

    /// Whether the pair ran recently enough that new-upload creation should
    /// wait. A per-destination sync frequency overrides the default.
    pub fn upload_frequency_exceeded(&self, warehouse: &Warehouse, default_freq: Duration) -> bool {
        let freq = warehouse
            .sync_frequency_secs
            .and_then(|secs| u64::try_from(secs).ok())
            .map(Duration::from_secs)
            .unwrap_or(default_freq);
        let Ok(freq) = chrono::Duration::from_std(freq) else {
            return false;
        };
        lock(&self.last_exec)
            .get(&warehouse.connection_key())
            .map(|last| Utc::now().signed_duration_since(*last) < freq)
            .unwrap_or(false)
    }

    pub fn set_last_exec(&self, connection_key: &str) {
        lock(&self.last_exec).insert(connection_key.to_string(), Utc::now());
    }

    /// Register a worker queue; returns false when one already exists.
    pub fn register_worker(&self, worker_id: &str, sender: mpsc::Sender<Vec<UploadJob>>) -> bool {
        let mut workers = lock(&self.workers);
        if workers.contains_key(worker_id) {
            return false;
        }
        workers.insert(worker_id.to_string(), sender);
        true
    }

    pub fn has_worker(&self, worker_id: &str) -> bool {
        lock(&self.workers).contains_key(worker_id)
    }

    pub fn worker_sender(&self, worker_id: &str) -> Option<mpsc::Sender<Vec<UploadJob>>> {
        lock(&self.workers).get(worker_id).cloned()
    }

    /// Claim an active-worker slot if the cap allows it.
    pub fn try_acquire_worker_slot(&self, cap: usize) -> bool {
        let mut active = lock(&self.active);
        if active.current >= cap {
            return false;
        }
        active.current += 1;
        active.high_water = active.high_water.max(active.current);
        true
    }

    pub fn release_worker_slot(&self) {
        let mut active = lock(&self.active);
        active.current = active.current.saturating_sub(1);
    }

    /// Currently active workers; reported by the health endpoint.
    pub fn active_workers(&self) -> usize {
        lock(&self.active).current
    }

    /// Highest concurrent worker count observed.
    pub fn max_active_workers(&self) -> usize {
        lock(&self.active).high_water
    }
}

/// Dispatcher tuning, carved out of the warehouse config.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub main_loop_sleep: Duration,
    pub upload_freq: Duration,
    pub sync_freq_ignore: bool,
    pub staging_files_batch_size: usize,
    pub min_retry_attempts: i64,
    pub retry_time_window: Duration,
}

impl From<&WarehouseConfig> for DispatcherConfig {
    fn from(config: &WarehouseConfig) -> Self {
        Self {
            main_loop_sleep: config.main_loop_sleep,
            upload_freq: config.upload_freq,
            sync_freq_ignore: config.sync_freq_ignore,
            staging_files_batch_size: config.staging_files_batch_size,
            min_retry_attempts: config.min_retry_attempts,
            retry_time_window: config.retry_time_window,
        }
    }
}

/// Dispatch error types
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl DispatchError {
    fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Journal(e) if e.is_fatal())
    }
}

/// Discovers and enqueues work for every warehouse of one destination type.
pub struct Dispatcher {
    destination_type: DestinationType,
    journal: Arc<dyn Journal>,
    adapter: Arc<dyn WarehouseAdapter>,
    config: DispatcherConfig,
    state: Arc<OrchestratorState>,
}

impl Dispatcher {
    pub fn new(
        destination_type: DestinationType,
        journal: Arc<dyn Journal>,
        adapter: Arc<dyn WarehouseAdapter>,
        config: DispatcherConfig,
        state: Arc<OrchestratorState>,
    ) -> Self {
        Self {
            destination_type,
            journal,
            adapter,
            config,
            state,
        }
    }

    /// Flag destinations that were mid-export when the process died.
    /// Called once at startup, before the loop runs.
    pub async fn prepare_crash_recovery(&self) -> JournalResult<()> {
        if !self.destination_type.crash_recoverable() {
            return Ok(());
        }
        for destination_id in self
            .journal
            .interrupted_destinations(self.destination_type)
            .await?
        {
            info!(
                destination_type = %self.destination_type,
                destination_id = %destination_id,
                "destination flagged for crash recovery"
            );
            self.state.mark_recovery(&destination_id);
        }
        Ok(())
    }

    /// Run forever; returns only on a fatal journal error, letting the
    /// caller decide to terminate the process.
    pub fn spawn(self) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            info!(destination_type = %self.destination_type, "dispatcher started");
            loop {
                tokio::time::sleep(self.config.main_loop_sleep).await;
                self.run_cycle().await?;
            }
        })
    }

    /// One pass over the active warehouses of this destination type.
    pub async fn run_cycle(&self) -> anyhow::Result<()> {
        for warehouse in self.state.warehouses_for(self.destination_type) {
            if let Err(e) = self.process_warehouse(&warehouse).await {
                if e.is_fatal() {
                    error!(
                        destination = %warehouse.identifier(),
                        error = %e,
                        "journal invariant violated, stopping dispatcher"
                    );
                    return Err(e.into());
                }
                error!(
                    destination = %warehouse.identifier(),
                    error = %e,
                    "failed to process warehouse"
                );
            }
        }
        Ok(())
    }

    async fn process_warehouse(&self, warehouse: &Warehouse) -> Result<(), DispatchError> {
        if !warehouse.enabled {
            return Ok(());
        }
        let connection_key = warehouse.connection_key();
        if self.state.is_in_progress(&connection_key) {
            debug!(destination = %warehouse.identifier(), "upload in progress, skipping");
            return Ok(());
        }

        // Crash recovery strictly precedes any new work for the
        // destination.
        if self.state.needs_recovery(&warehouse.destination_id) {
            info!(destination = %warehouse.identifier(), "running crash recovery");
            self.adapter.crash_recover(warehouse).await?;
            self.state.clear_recovery(&warehouse.destination_id);
        }

        // Pending uploads come first; new uploads wait until the backlog
        // for this pair is drained.
        let pending = self
            .journal
            .pending_uploads(
                self.destination_type,
                &warehouse.source_id,
                &warehouse.destination_id,
            )
            .await?;
        if !pending.is_empty() {
            debug!(
                destination = %warehouse.identifier(),
                pending = pending.len(),
                "found pending uploads"
            );
            let jobs = self.jobs_for_pending_uploads(warehouse, pending).await?;
            if !jobs.is_empty() {
                self.enqueue(warehouse, jobs).await;
            }
            return Ok(());
        }

        if !self.config.sync_freq_ignore
            && self
                .state
                .upload_frequency_exceeded(warehouse, self.config.upload_freq)
        {
            debug!(destination = %warehouse.identifier(), "upload frequency not exceeded, skipping");
            return Ok(());
        }

        let staging_files = self
            .journal
            .pending_staging_files(&warehouse.source_id, &warehouse.destination_id)
            .await?;
        if staging_files.is_empty() {
            return Ok(());
        }

        let jobs = self
            .jobs_for_new_staging_files(warehouse, staging_files)
            .await?;
        self.state.set_last_exec(&connection_key);
        self.enqueue(warehouse, jobs).await;
        Ok(())
    }

    /// Convert pending uploads to jobs in id order, aborting any whose
    /// retries are exhausted so the pair cannot stall forever.
    async fn jobs_for_pending_uploads(
        &self,
        warehouse: &Warehouse,
        pending: Vec<Upload>,
    ) -> Result<Vec<UploadJob>, DispatchError> {
        let now = Utc::now();
        let mut jobs = Vec::new();
        for upload in pending {
            if self.retries_exhausted(&upload, now) {
                warn!(
                    upload_id = upload.id,
                    destination = %warehouse.identifier(),
                    attempts = upload.attempts(),
                    "retries exhausted, aborting upload"
                );
                self.journal
                    .set_upload_status(upload.id, UploadState::Aborted, Some("retries exhausted"))
                    .await?;
                continue;
            }
            let staging_files = self
                .journal
                .staging_files_in_range(
                    &warehouse.source_id,
                    &warehouse.destination_id,
                    upload.start_staging_file_id,
                    upload.end_staging_file_id,
                )
                .await?;
            jobs.push(UploadJob::new(
                upload,
                staging_files,
                warehouse.clone(),
                self.journal.clone(),
                self.adapter.clone(),
            ));
        }
        Ok(jobs)
    }

    /// An upload may still run while it has attempts left or its first
    /// attempt is younger than the retry window.
    fn retries_exhausted(&self, upload: &Upload, now: DateTime<Utc>) -> bool {
        if upload.attempts() < self.config.min_retry_attempts {
            return false;
        }
        let Ok(window) = chrono::Duration::from_std(self.config.retry_time_window) else {
            return false;
        };
        match upload.first_attempt_at() {
            Some(first_attempt) => now.signed_duration_since(first_attempt) >= window,
            None => false,
        }
    }

    /// Split new staging files into contiguous batches and journal one
    /// upload per batch.
    async fn jobs_for_new_staging_files(
        &self,
        warehouse: &Warehouse,
        staging_files: Vec<StagingFile>,
    ) -> Result<Vec<UploadJob>, DispatchError> {
        let mut jobs = Vec::new();
        for chunk in staging_files.chunks(self.config.staging_files_batch_size.max(1)) {
            let upload = self.journal.insert_upload(warehouse, chunk).await?;
            info!(
                upload_id = upload.id,
                destination = %warehouse.identifier(),
                start = upload.start_staging_file_id,
                end = upload.end_staging_file_id,
                "created upload"
            );
            jobs.push(UploadJob::new(
                upload,
                chunk.to_vec(),
                warehouse.clone(),
                self.journal.clone(),
                self.adapter.clone(),
            ));
        }
        Ok(jobs)
    }

    /// Claim the pair and hand the batch to its worker. The bounded queue
    /// applies backpressure: a saturated worker blocks the dispatcher here.
    async fn enqueue(&self, warehouse: &Warehouse, jobs: Vec<UploadJob>) {
        let worker_id = warehouse.worker_id();
        let Some(sender) = self.state.worker_sender(&worker_id) else {
            warn!(worker = %worker_id, "no worker registered, dropping cycle");
            return;
        };
        let connection_key = warehouse.connection_key();
        self.state.set_in_progress(&connection_key, true);
        if sender.send(jobs).await.is_err() {
            warn!(worker = %worker_id, "worker queue closed, releasing claim");
            self.state.set_in_progress(&connection_key, false);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, MockAdapter, MockCall};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_batch_success() {
        let harness = fixtures::Harness::new().with_staging_id_base(10);
        let adapter = Arc::new(MockAdapter::new());
        let dispatcher = harness.dispatcher(adapter.clone(), fixtures::dispatcher_config());

        harness
            .announce_staging_files(5, &[("pageviews", &[("id", "string")])], true)
            .await;
        dispatcher.run_cycle().await.unwrap();

        let upload_id = harness
            .wait_for_single_upload(UploadState::ExportedData, Duration::from_secs(2))
            .await;
        let upload = harness.upload(upload_id).await;
        assert_eq!(upload.start_staging_file_id, 10);
        assert_eq!(upload.end_staging_file_id, 14);
        assert_eq!(adapter.count(MockCall::CreateTable("pageviews".into())), 1);
        assert_eq!(adapter.count(MockCall::LoadTable("pageviews".into())), 1);
    }

    #[tokio::test]
    async fn test_batching_splits_staging_files() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let mut config = fixtures::dispatcher_config();
        config.staging_files_batch_size = 2;
        let dispatcher = harness.dispatcher(adapter.clone(), config);

        harness
            .announce_staging_files(5, &[("pageviews", &[("id", "string")])], true)
            .await;
        dispatcher.run_cycle().await.unwrap();

        harness
            .wait_for_all_uploads(UploadState::ExportedData, 3, Duration::from_secs(2))
            .await;
        let ranges = harness.upload_ranges().await;
        assert_eq!(ranges, vec![(1, 2), (3, 4), (5, 5)]);
    }

    #[tokio::test]
    async fn test_retry_then_abort() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_load_table("pageviews", 100);
        let mut config = fixtures::dispatcher_config();
        config.min_retry_attempts = 3;
        config.retry_time_window = Duration::from_secs(3600);
        let dispatcher = harness.dispatcher(adapter.clone(), config);

        harness
            .announce_staging_files(5, &[("pageviews", &[("id", "string")])], true)
            .await;

        // First cycle creates the upload; three more retry it. Attempts
        // pass min_retry_attempts but the window keeps it alive.
        for expected_attempts in 1..=4i64 {
            dispatcher.run_cycle().await.unwrap();
            harness
                .wait_for_attempts(expected_attempts, Duration::from_secs(2))
                .await;
            harness.wait_for_idle(Duration::from_secs(2)).await;
        }

        // Age the upload past the window; the next cycle aborts it.
        let upload_id = harness.only_upload_id().await;
        harness
            .backdate_first_timing(upload_id, chrono::Duration::hours(2))
            .await;
        dispatcher.run_cycle().await.unwrap();
        assert_eq!(harness.upload(upload_id).await.status, UploadState::Aborted);

        // The pair is unblocked: new staging files produce a fresh upload.
        adapter.clear_failures();
        harness
            .announce_staging_files(2, &[("pageviews", &[("id", "string")])], true)
            .await;
        dispatcher.run_cycle().await.unwrap();
        harness
            .wait_until_uploads(
                |uploads| uploads.iter().any(|u| u.status == UploadState::ExportedData),
                Duration::from_secs(2),
            )
            .await;
    }

    #[tokio::test]
    async fn test_crash_recovery_runs_before_work() {
        let harness = fixtures::Harness::new().with_destination_type(DestinationType::Redshift);
        let adapter = Arc::new(MockAdapter::new());
        let upload_id = harness
            .seed_upload(&[("pageviews", &[("id", "string")])], true)
            .await;
        harness.force_status(upload_id, UploadState::ExportingData).await;

        let dispatcher = harness.dispatcher(adapter.clone(), fixtures::dispatcher_config());
        dispatcher.prepare_crash_recovery().await.unwrap();
        assert!(harness.state().needs_recovery("dst-1"));

        dispatcher.run_cycle().await.unwrap();
        harness
            .wait_for_status(upload_id, UploadState::ExportedData, Duration::from_secs(2))
            .await;

        let sequence = adapter.call_sequence();
        assert_eq!(sequence.first().map(String::as_str), Some("crash_recover"));
        assert!(!harness.state().needs_recovery("dst-1"));

        // Recovery runs once, not on every cycle.
        harness.wait_for_idle(Duration::from_secs(2)).await;
        dispatcher.run_cycle().await.unwrap();
        assert_eq!(
            adapter.call_sequence().iter().filter(|c| *c == "crash_recover").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_in_progress_pair_is_skipped() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let dispatcher = harness.dispatcher(adapter.clone(), fixtures::dispatcher_config());

        harness
            .announce_staging_files(2, &[("pageviews", &[("id", "string")])], true)
            .await;
        harness
            .state()
            .set_in_progress("source:src-1:destination:dst-1", true);
        dispatcher.run_cycle().await.unwrap();

        assert!(harness.upload_ranges().await.is_empty());
    }

    #[tokio::test]
    async fn test_frequency_gate_blocks_new_uploads() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let mut config = fixtures::dispatcher_config();
        config.upload_freq = Duration::from_secs(3600);
        let dispatcher = harness.dispatcher(adapter.clone(), config);

        harness
            .announce_staging_files(1, &[("pageviews", &[("id", "string")])], true)
            .await;
        dispatcher.run_cycle().await.unwrap();
        harness
            .wait_for_all_uploads(UploadState::ExportedData, 1, Duration::from_secs(2))
            .await;
        harness.wait_for_idle(Duration::from_secs(2)).await;

        // More staging files arrive, but the gate holds them back.
        harness
            .announce_staging_files(1, &[("pageviews", &[("id", "string")])], true)
            .await;
        dispatcher.run_cycle().await.unwrap();
        assert_eq!(harness.upload_ranges().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_freq_ignore_bypasses_gate() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let mut config = fixtures::dispatcher_config();
        config.upload_freq = Duration::from_secs(3600);
        config.sync_freq_ignore = true;
        let dispatcher = harness.dispatcher(adapter.clone(), config);

        harness
            .announce_staging_files(1, &[("pageviews", &[("id", "string")])], true)
            .await;
        dispatcher.run_cycle().await.unwrap();
        harness
            .wait_for_all_uploads(UploadState::ExportedData, 1, Duration::from_secs(2))
            .await;
        harness.wait_for_idle(Duration::from_secs(2)).await;

        harness
            .announce_staging_files(1, &[("pageviews", &[("id", "string")])], true)
            .await;
        dispatcher.run_cycle().await.unwrap();
        harness
            .wait_until_uploads(|uploads| uploads.len() == 2, Duration::from_secs(2))
            .await;
    }

    #[tokio::test]
    async fn test_disabled_warehouse_is_ignored() {
        let harness = fixtures::Harness::new().with_disabled_warehouse();
        let adapter = Arc::new(MockAdapter::new());
        let dispatcher = harness.dispatcher(adapter.clone(), fixtures::dispatcher_config());

        harness
            .announce_staging_files(2, &[("pageviews", &[("id", "string")])], true)
            .await;
        dispatcher.run_cycle().await.unwrap();
        assert!(harness.upload_ranges().await.is_empty());
    }
}
