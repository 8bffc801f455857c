//! Upload job execution
//!
//! One [`UploadJob`] drives a single upload through its phases, resuming
//! from whatever state the journal last recorded:
//!
//! 1. load-file accounting (`generating_load_files`)
//! 2. schema migration (`updating_schema`)
//! 3. data export (`exporting_data`), with per-table sub-states
//!
//! A phase failure transitions the upload to the matching `*_failed` state,
//! records the error under that state's key, and stops the job; the
//! dispatcher rediscovers the upload as pending on its next cycle.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapter::WarehouseAdapter;
use crate::journal::{Journal, JournalError, JournalResult};
use crate::model::{StagingFile, Upload, Warehouse};
use crate::schema::SchemaDiff;
use crate::state::{TableUploadState, UploadState};

/// Table that must load before the users table.
pub const IDENTIFIES_TABLE: &str = "identifies";

/// Table loaded by a merge query referencing identifies.
pub const USERS_TABLE: &str = "users";

/// Error recorded against the users table when identifies fails.
pub const IDENTIFIES_FAILED_ERROR: &str = "Failed to upload identifies table";

/// Job error types
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("{phase} failed: {message}")]
    Phase { phase: UploadState, message: String },
}

/// Runs one upload against its destination.
pub struct UploadJob {
    pub upload: Upload,
    pub staging_files: Vec<StagingFile>,
    pub warehouse: Warehouse,
    journal: Arc<dyn Journal>,
    adapter: Arc<dyn WarehouseAdapter>,
    force_load: bool,
}

impl UploadJob {
    pub fn new(
        upload: Upload,
        staging_files: Vec<StagingFile>,
        warehouse: Warehouse,
        journal: Arc<dyn Journal>,
        adapter: Arc<dyn WarehouseAdapter>,
    ) -> Self {
        Self {
            upload,
            staging_files,
            warehouse,
            journal,
            adapter,
            force_load: false,
        }
    }

    /// Reload tables even when their table-upload row is already exported.
    pub fn with_force_load(mut self, force_load: bool) -> Self {
        self.force_load = force_load;
        self
    }

    /// Drive the upload from its current state to `exported_data`, or to
    /// the failure fork of whichever phase broke.
    pub async fn run(&mut self) -> Result<(), JobError> {
        use UploadState::*;

        if self.upload.status.is_terminal() {
            return Ok(());
        }
        info!(
            upload_id = self.upload.id,
            destination = %self.warehouse.identifier(),
            status = %self.upload.status,
            "running upload job"
        );

        if matches!(
            self.upload.status,
            Waiting | GeneratingLoadFiles | GeneratingLoadFilesFailed
        ) {
            self.generate_load_files().await?;
        }
        if matches!(
            self.upload.status,
            GeneratedLoadFiles | UpdatingSchema | UpdatingSchemaFailed
        ) {
            self.update_schema().await?;
        }
        self.export_data().await
    }

    async fn transition(&mut self, state: UploadState) -> Result<(), JobError> {
        self.journal
            .set_upload_status(self.upload.id, state, None)
            .await?;
        self.upload.status = state;
        Ok(())
    }

    /// Record a phase failure and surface it to the worker.
    async fn fail(&mut self, phase: UploadState, message: String) -> JobError {
        let failed = phase.failure().unwrap_or(phase);
        if let Err(e) = self
            .journal
            .set_upload_status(self.upload.id, failed, Some(&message))
            .await
        {
            return e.into();
        }
        self.upload.status = failed;
        JobError::Phase {
            phase,
            message,
        }
    }

    /// Resolve and persist the load-file id range covering this upload's
    /// staging files. The load files themselves are produced out of
    /// process; an empty range is legal and short-circuits the export.
    async fn generate_load_files(&mut self) -> Result<(), JobError> {
        self.transition(UploadState::GeneratingLoadFiles).await?;

        let range_result = self
            .journal
            .load_file_range(
                self.upload.start_staging_file_id,
                self.upload.end_staging_file_id,
            )
            .await;
        let range = match range_result {
            Ok(range) => range.unwrap_or((0, 0)),
            Err(e) => {
                return Err(self
                    .fail(UploadState::GeneratingLoadFiles, e.to_string())
                    .await)
            }
        };

        self.journal
            .set_load_file_range(self.upload.id, range.0, range.1)
            .await?;
        self.upload.start_load_file_id = range.0;
        self.upload.end_load_file_id = range.1;
        self.transition(UploadState::GeneratedLoadFiles).await
    }

    /// Apply the diff between the journaled snapshot and this upload's
    /// merged schema, then persist the new snapshot. Persisting happens
    /// only after `updated_schema` is journaled, so a crash in between
    /// re-runs the (idempotent) migration rather than skipping it.
    async fn update_schema(&mut self) -> Result<(), JobError> {
        self.transition(UploadState::UpdatingSchema).await?;

        let current = self
            .journal
            .schema_snapshot(
                &self.upload.source_id,
                &self.upload.destination_id,
                &self.upload.namespace,
            )
            .await?
            .unwrap_or_default();

        let diff = SchemaDiff::between(&current, &self.upload.schema);
        debug!(
            upload_id = self.upload.id,
            new_tables = diff.new_tables.len(),
            altered_tables = diff.new_columns.len(),
            "applying schema diff"
        );

        for (table, columns) in &diff.new_tables {
            let result = self
                .adapter
                .create_table(&self.warehouse, table, columns)
                .await;
            match result {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(table = %table, "table already exists, continuing");
                }
                Err(e) => return Err(self.fail(UploadState::UpdatingSchema, e.to_string()).await),
            }
        }
        for (table, columns) in &diff.new_columns {
            for (column, column_type) in columns {
                let result = self
                    .adapter
                    .add_column(&self.warehouse, table, column, *column_type)
                    .await;
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_already_exists() => {
                        debug!(table = %table, column = %column, "column already exists, continuing");
                    }
                    Err(e) => {
                        return Err(self.fail(UploadState::UpdatingSchema, e.to_string()).await)
                    }
                }
            }
        }

        let mut updated = current;
        updated.merge_from(&self.upload.schema);
        self.transition(UploadState::UpdatedSchema).await?;
        self.journal
            .update_schema_snapshot(
                &self.upload.source_id,
                &self.upload.destination_id,
                &self.upload.namespace,
                &updated,
            )
            .await?;
        Ok(())
    }

    /// Load every table of the upload schema. Identifies loads before
    /// users; everything else fans out up to the adapter's parallel-load
    /// cap. Table failures are collected rather than short-circuiting so
    /// that independent tables still make progress.
    async fn export_data(&mut self) -> Result<(), JobError> {
        self.transition(UploadState::ExportingData).await?;

        let tables: Vec<String> = self.upload.schema.tables().cloned().collect();
        self.journal
            .init_table_uploads(self.upload.id, &tables)
            .await?;
        let prior: HashMap<String, TableUploadState> = self
            .journal
            .table_uploads(self.upload.id)
            .await?
            .into_iter()
            .map(|t| (t.table_name, t.status))
            .collect();

        let mut failures: Vec<String> = Vec::new();

        // Regular tables, bounded fan-out.
        let regular: Vec<&String> = tables
            .iter()
            .filter(|t| t.as_str() != IDENTIFIES_TABLE && t.as_str() != USERS_TABLE)
            .collect();
        let this = &*self;
        let results: Vec<JournalResult<Option<String>>> = stream::iter(regular)
            .map(|table| {
                let table_prior = prior.get(table).copied();
                async move { this.load_regular_table(table, table_prior).await }
            })
            .buffer_unordered(this.adapter.max_parallel_loads().max(1))
            .collect()
            .await;
        for result in results {
            if let Some(message) = result? {
                failures.push(message);
            }
        }

        // Identity tables, strictly ordered.
        failures.extend(self.load_identity_tables(&prior).await?);

        if failures.is_empty() {
            self.transition(UploadState::ExportedData).await?;
            self.journal
                .mark_staging_files_consumed(
                    &self.upload.source_id,
                    &self.upload.destination_id,
                    self.upload.start_staging_file_id,
                    self.upload.end_staging_file_id,
                )
                .await?;
            info!(upload_id = self.upload.id, "upload exported");
            Ok(())
        } else {
            let message = failures.join("; ");
            warn!(upload_id = self.upload.id, error = %message, "export failed");
            Err(self.fail(UploadState::ExportingData, message).await)
        }
    }

    /// Load one non-identity table. Returns `Ok(Some(message))` when the
    /// table failed (already recorded on its table-upload row).
    async fn load_regular_table(
        &self,
        table: &str,
        prior: Option<TableUploadState>,
    ) -> JournalResult<Option<String>> {
        if prior == Some(TableUploadState::ExportedData) && !self.force_load {
            debug!(upload_id = self.upload.id, table, "table already exported, skipping");
            return Ok(None);
        }

        let load_files = self
            .journal
            .load_files_for_table(
                table,
                self.upload.start_load_file_id,
                self.upload.end_load_file_id,
            )
            .await?;
        if load_files.is_empty() {
            self.journal
                .set_table_upload_status(
                    self.upload.id,
                    table,
                    TableUploadState::ExportedData,
                    None,
                )
                .await?;
            return Ok(None);
        }

        self.journal
            .set_table_upload_status(self.upload.id, table, TableUploadState::Executing, None)
            .await?;
        match self
            .adapter
            .load_table(&self.warehouse, table, &load_files, self.force_load)
            .await
        {
            Ok(()) => {
                self.journal
                    .set_table_upload_status(
                        self.upload.id,
                        table,
                        TableUploadState::ExportedData,
                        None,
                    )
                    .await?;
                Ok(None)
            }
            Err(e) => {
                let message = format!("{table}: {e}");
                self.journal
                    .set_table_upload_status(
                        self.upload.id,
                        table,
                        TableUploadState::ExportingDataFailed,
                        Some(&message),
                    )
                    .await?;
                Ok(Some(message))
            }
        }
    }

    /// Identifies first, then users via the adapter's merge path. A failed
    /// identifies load marks users failed with a dependent-failure error
    /// without attempting it.
    async fn load_identity_tables(
        &self,
        prior: &HashMap<String, TableUploadState>,
    ) -> JournalResult<Vec<String>> {
        let has_identifies = self.upload.schema.contains_table(IDENTIFIES_TABLE);
        let has_users = self.upload.schema.contains_table(USERS_TABLE);
        let mut failures = Vec::new();

        let mut identifies_ok = true;
        if has_identifies {
            if let Some(message) = self
                .load_regular_table(IDENTIFIES_TABLE, prior.get(IDENTIFIES_TABLE).copied())
                .await?
            {
                identifies_ok = false;
                failures.push(message);
            }
        }

        if has_users {
            if !identifies_ok {
                self.journal
                    .set_table_upload_status(
                        self.upload.id,
                        USERS_TABLE,
                        TableUploadState::ExportingDataFailed,
                        Some(IDENTIFIES_FAILED_ERROR),
                    )
                    .await?;
                failures.push(IDENTIFIES_FAILED_ERROR.to_string());
            } else if let Some(message) = self.load_users_table(prior.get(USERS_TABLE).copied()).await? {
                failures.push(message);
            }
        }

        Ok(failures)
    }

    async fn load_users_table(
        &self,
        prior: Option<TableUploadState>,
    ) -> JournalResult<Option<String>> {
        if prior == Some(TableUploadState::ExportedData) && !self.force_load {
            return Ok(None);
        }

        let load_files = self
            .journal
            .load_files_for_table(
                USERS_TABLE,
                self.upload.start_load_file_id,
                self.upload.end_load_file_id,
            )
            .await?;
        if load_files.is_empty() {
            self.journal
                .set_table_upload_status(
                    self.upload.id,
                    USERS_TABLE,
                    TableUploadState::ExportedData,
                    None,
                )
                .await?;
            return Ok(None);
        }

        self.journal
            .set_table_upload_status(
                self.upload.id,
                USERS_TABLE,
                TableUploadState::Executing,
                None,
            )
            .await?;
        match self
            .adapter
            .load_users_table(&self.warehouse, &load_files)
            .await
        {
            Ok(()) => {
                self.journal
                    .set_table_upload_status(
                        self.upload.id,
                        USERS_TABLE,
                        TableUploadState::ExportedData,
                        None,
                    )
                    .await?;
                Ok(None)
            }
            Err(e) => {
                let message = format!("{USERS_TABLE}: {e}");
                self.journal
                    .set_table_upload_status(
                        self.upload.id,
                        USERS_TABLE,
                        TableUploadState::ExportingDataFailed,
                        Some(&message),
                    )
                    .await?;
                Ok(Some(message))
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
    use std::sync::Arc;

    async fn run_job(
        harness: &fixtures::Harness,
        adapter: Arc<MockAdapter>,
        upload_id: i64,
    ) -> Result<(), JobError> {
        let mut job = harness.job_for_upload(upload_id, adapter).await;
        job.run().await
    }

    #[tokio::test]
    async fn test_happy_path_reaches_exported_data() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let upload_id = harness
            .seed_upload(&[("pageviews", &[("id", "string")])], true)
            .await;

        run_job(&harness, adapter.clone(), upload_id).await.unwrap();

        let upload = harness.upload(upload_id).await;
        assert_eq!(upload.status, UploadState::ExportedData);
        assert_eq!(adapter.count(MockCall::CreateTable("pageviews".into())), 1);
        assert_eq!(adapter.count(MockCall::LoadTable("pageviews".into())), 1);

        // Every table in the schema reached exported_data.
        for table in harness.table_uploads(upload_id).await {
            assert_eq!(table.status, crate::state::TableUploadState::ExportedData);
        }
    }

    #[tokio::test]
    async fn test_schema_migration_is_idempotent() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let first = harness
            .seed_upload(&[("pageviews", &[("id", "string")])], true)
            .await;
        run_job(&harness, adapter.clone(), first).await.unwrap();

        let snapshot_before = harness.snapshot().await;
        let second = harness
            .seed_upload(&[("pageviews", &[("id", "string")])], true)
            .await;
        run_job(&harness, adapter.clone(), second).await.unwrap();

        // Second migration found nothing to do and left the snapshot alone.
        assert_eq!(adapter.count(MockCall::CreateTable("pageviews".into())), 1);
        assert_eq!(adapter.total_add_columns(), 0);
        assert_eq!(harness.snapshot().await, snapshot_before);
    }

    #[tokio::test]
    async fn test_already_exists_is_success() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_create_table_with_already_exists("pageviews");
        let upload_id = harness
            .seed_upload(&[("pageviews", &[("id", "string")])], true)
            .await;

        run_job(&harness, adapter, upload_id).await.unwrap();
        assert_eq!(harness.upload(upload_id).await.status, UploadState::ExportedData);
    }

    #[tokio::test]
    async fn test_empty_load_file_range_short_circuits() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        // No load files seeded for this upload.
        let upload_id = harness
            .seed_upload(&[("pageviews", &[("id", "string")])], false)
            .await;

        run_job(&harness, adapter.clone(), upload_id).await.unwrap();
        assert_eq!(harness.upload(upload_id).await.status, UploadState::ExportedData);
        assert_eq!(adapter.count(MockCall::LoadTable("pageviews".into())), 0);
    }

    #[tokio::test]
    async fn test_load_failure_records_exporting_data_failed() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_load_table("pageviews", 1);
        let upload_id = harness
            .seed_upload(&[("pageviews", &[("id", "string")])], true)
            .await;

        let err = run_job(&harness, adapter, upload_id).await.unwrap_err();
        assert!(matches!(err, JobError::Phase { phase: UploadState::ExportingData, .. }));

        let upload = harness.upload(upload_id).await;
        assert_eq!(upload.status, UploadState::ExportingDataFailed);
        assert_eq!(upload.attempts(), 1);
        assert!(!upload.errors_for(UploadState::ExportingDataFailed).is_empty());
    }

    #[tokio::test]
    async fn test_identifies_loads_before_users() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let upload_id = harness
            .seed_upload(
                &[
                    ("identifies", &[("user_id", "string")]),
                    ("users", &[("user_id", "string")]),
                ],
                true,
            )
            .await;

        run_job(&harness, adapter.clone(), upload_id).await.unwrap();

        let calls = adapter.load_sequence();
        let identifies_pos = calls.iter().position(|t| t == "identifies").unwrap();
        let users_pos = calls.iter().position(|t| t == "users:merge").unwrap();
        assert!(identifies_pos < users_pos);
    }

    #[tokio::test]
    async fn test_identifies_failure_aborts_users() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_load_table("identifies", 1);
        let upload_id = harness
            .seed_upload(
                &[
                    ("identifies", &[("user_id", "string")]),
                    ("users", &[("user_id", "string")]),
                ],
                true,
            )
            .await;

        run_job(&harness, adapter.clone(), upload_id).await.unwrap_err();

        // Users was never attempted and carries the dependent-failure error.
        assert!(adapter.load_sequence().iter().all(|t| t != "users:merge"));
        let users = harness
            .table_uploads(upload_id)
            .await
            .into_iter()
            .find(|t| t.table_name == USERS_TABLE)
            .unwrap();
        assert_eq!(users.status, crate::state::TableUploadState::ExportingDataFailed);
        assert_eq!(users.error.as_deref(), Some(IDENTIFIES_FAILED_ERROR));
    }

    #[tokio::test]
    async fn test_resume_from_exporting_data_skips_schema_phase() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        let upload_id = harness
            .seed_upload(&[("pageviews", &[("id", "string")])], true)
            .await;
        // Emulate a crash after the first two phases completed.
        harness.force_load_file_range(upload_id, 1, 2).await;
        harness
            .force_status(upload_id, UploadState::ExportingData)
            .await;

        run_job(&harness, adapter.clone(), upload_id).await.unwrap();

        assert_eq!(adapter.count(MockCall::CreateTable("pageviews".into())), 0);
        assert_eq!(adapter.count(MockCall::LoadTable("pageviews".into())), 1);
        assert_eq!(harness.upload(upload_id).await.status, UploadState::ExportedData);
    }

    #[tokio::test]
    async fn test_exported_table_is_skipped_unless_forced() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_load_table("clicks", 1);
        let upload_id = harness
            .seed_upload(
                &[
                    ("pageviews", &[("id", "string")]),
                    ("clicks", &[("id", "string")]),
                ],
                true,
            )
            .await;

        // First run: pageviews exports, clicks fails.
        run_job(&harness, adapter.clone(), upload_id).await.unwrap_err();
        assert_eq!(adapter.count(MockCall::LoadTable("pageviews".into())), 1);

        // Retry: only clicks is loaded again.
        run_job(&harness, adapter.clone(), upload_id).await.unwrap();
        assert_eq!(adapter.count(MockCall::LoadTable("pageviews".into())), 1);
        assert_eq!(adapter.count(MockCall::LoadTable("clicks".into())), 2);
        assert_eq!(harness.upload(upload_id).await.status, UploadState::ExportedData);
    }

    #[tokio::test]
    async fn test_parallel_loads_respect_cap() {
        let harness = fixtures::Harness::new();
        let adapter = Arc::new(MockAdapter::new().with_max_parallel_loads(2).with_load_delay_ms(20));
        let tables: Vec<(&str, &[(&str, &str)])> = vec![
            ("t1", &[("id", "string")]),
            ("t2", &[("id", "string")]),
            ("t3", &[("id", "string")]),
            ("t4", &[("id", "string")]),
            ("t5", &[("id", "string")]),
        ];
        let upload_id = harness.seed_upload(&tables, true).await;

        run_job(&harness, adapter.clone(), upload_id).await.unwrap();
        assert!(adapter.max_concurrent_loads() <= 2);
    }
}
