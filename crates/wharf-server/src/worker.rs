//! Per-destination workers
//!
//! One worker task serves each `(destination_id, namespace)` pair, reading
//! batches of upload jobs from a bounded queue. Before touching a batch the
//! worker claims a slot against the global active-worker cap, sleeping and
//! retrying while the engine is saturated. Jobs inside a batch run
//! sequentially; the first failure abandons the rest of the batch so later
//! uploads cannot overtake a failed earlier one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dispatcher::OrchestratorState;
use crate::job::UploadJob;

/// Worker tuning, carved out of the warehouse config.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Global cap on simultaneously active workers.
    pub no_of_workers: usize,
    /// Sleep between slot-acquisition attempts when saturated.
    pub retry_sleep: Duration,
    /// Queue capacity per worker.
    pub queue_depth: usize,
}

/// Spawn a worker for `identifier` and return its job queue.
pub fn spawn_worker(
    identifier: String,
    state: Arc<OrchestratorState>,
    config: WorkerConfig,
) -> mpsc::Sender<Vec<UploadJob>> {
    let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
    run_worker(identifier, state, config, rx);
    tx
}

fn run_worker(
    identifier: String,
    state: Arc<OrchestratorState>,
    config: WorkerConfig,
    mut rx: mpsc::Receiver<Vec<UploadJob>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(worker = %identifier, "worker started");
        while let Some(batch) = rx.recv().await {
            if batch.is_empty() {
                continue;
            }
            let connection_key = batch[0].warehouse.connection_key();

            acquire_slot(&state, &config).await;
            process_batch(&identifier, batch).await;
            state.release_worker_slot();

            // The pair is claimable again whether the batch succeeded or
            // not; failures are rediscovered as pending uploads.
            state.set_in_progress(&connection_key, false);
        }
        info!(worker = %identifier, "worker stopped");
    })
}

/// Claim a slot against the global cap, sleeping while saturated.
async fn acquire_slot(state: &OrchestratorState, config: &WorkerConfig) {
    loop {
        if state.try_acquire_worker_slot(config.no_of_workers) {
            return;
        }
        debug!(
            cap = config.no_of_workers,
            "active-worker cap reached, sleeping"
        );
        tokio::time::sleep(config.retry_sleep).await;
    }
}

/// Run the batch in order, abandoning it on the first failure.
async fn process_batch(identifier: &str, batch: Vec<UploadJob>) {
    for mut job in batch {
        let upload_id = job.upload.id;
        let destination = job.warehouse.identifier();
        match job.run().await {
            Ok(()) => {
                info!(
                    worker = %identifier,
                    upload_id,
                    destination = %destination,
                    delivery = "delivered",
                    "upload job finished"
                );
            }
            Err(e) => {
                error!(
                    worker = %identifier,
                    upload_id,
                    destination = %destination,
                    delivery = "failed",
                    error = %e,
                    "upload job failed, abandoning batch"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state::UploadState;
    use crate::testing::{fixtures, MockAdapter, MockCall};

    fn worker_config(cap: usize) -> WorkerConfig {
        WorkerConfig {
            no_of_workers: cap,
            retry_sleep: Duration::from_millis(5),
            queue_depth: 100,
        }
    }

    #[tokio::test]
    async fn test_batch_runs_in_order() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let state = Arc::new(OrchestratorState::new());

        let mut jobs = Vec::new();
        for _ in 0..3 {
            let upload_id = harness
                .seed_upload(&[("pageviews", &[("id", "string")])], true)
                .await;
            jobs.push(harness.job_for_upload(upload_id, adapter.clone()).await);
        }
        let ids: Vec<i64> = jobs.iter().map(|j| j.upload.id).collect();
        state.set_in_progress(&jobs[0].warehouse.connection_key(), true);

        let tx = spawn_worker("w1".to_string(), state.clone(), worker_config(2));
        tx.send(jobs).await.unwrap();

        for id in ids {
            harness
                .wait_for_status(id, UploadState::ExportedData, Duration::from_secs(2))
                .await;
        }
        // Claim released once the batch is done.
        harness
            .wait_until(
                || !state.is_in_progress("source:src-1:destination:dst-1"),
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(state.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_failure_abandons_rest_of_batch() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_load_table("pageviews", 1);
        let state = Arc::new(OrchestratorState::new());

        let mut jobs = Vec::new();
        for _ in 0..2 {
            let upload_id = harness
                .seed_upload(&[("pageviews", &[("id", "string")])], true)
                .await;
            jobs.push(harness.job_for_upload(upload_id, adapter.clone()).await);
        }
        let first = jobs[0].upload.id;
        let second = jobs[1].upload.id;
        let key = jobs[0].warehouse.connection_key();
        state.set_in_progress(&key, true);

        let tx = spawn_worker("w1".to_string(), state.clone(), worker_config(2));
        tx.send(jobs).await.unwrap();

        harness
            .wait_for_status(first, UploadState::ExportingDataFailed, Duration::from_secs(2))
            .await;
        harness
            .wait_until(|| !state.is_in_progress(&key), Duration::from_secs(1))
            .await;

        // The second upload was never started.
        assert_eq!(harness.upload(second).await.status, UploadState::Waiting);
        assert_eq!(adapter.count(MockCall::LoadTable("pageviews".into())), 1);
    }

    #[tokio::test]
    async fn test_worker_cap_is_respected() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new().with_load_delay_ms(30));
        let state = Arc::new(OrchestratorState::new());

        // Three single-job batches on three workers, cap 1.
        let mut senders = Vec::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let upload_id = harness
                .seed_upload(&[("pageviews", &[("id", "string")])], true)
                .await;
            ids.push(upload_id);
            let job = harness.job_for_upload(upload_id, adapter.clone()).await;
            state.set_in_progress(&job.warehouse.connection_key(), true);
            let tx = spawn_worker(format!("w{i}"), state.clone(), worker_config(1));
            tx.send(vec![job]).await.unwrap();
        }

        for id in ids {
            harness
                .wait_for_status(id, UploadState::ExportedData, Duration::from_secs(5))
                .await;
        }
        assert!(state.max_active_workers() <= 1);
    }
}
