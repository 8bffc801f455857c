//! Test doubles: an in-memory journal, a recording warehouse adapter, and
//! a harness wiring them to real dispatchers and workers.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::adapter::{AdapterError, WarehouseAdapter};
use crate::journal::pg::merge_error;
use crate::journal::{Journal, JournalError, JournalResult};
use crate::model::{
    DestinationType, LoadFile, NewLoadFile, NewStagingFile, StagingFile, StagingFileStatus,
    TableUpload, Timings, Upload, Warehouse,
};
use crate::schema::WarehouseSchema;
use crate::state::{TableUploadState, UploadState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// In-memory journal
// ============================================================================

#[derive(Default)]
struct MemState {
    staging: Vec<StagingFile>,
    next_staging_id: i64,
    uploads: Vec<Upload>,
    next_upload_id: i64,
    table_uploads: Vec<TableUpload>,
    schemas: HashMap<(String, String, String), WarehouseSchema>,
    load_files: Vec<LoadFile>,
    next_load_file_id: i64,
}

/// Journal over mutexed vectors, mirroring the Postgres semantics.
#[derive(Default)]
pub struct MemJournal {
    inner: Mutex<MemState>,
}

impl MemJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start staging-file ids at `base` instead of 1.
    pub fn set_next_staging_id(&self, base: i64) {
        lock(&self.inner).next_staging_id = base - 1;
    }

    pub fn get_upload(&self, upload_id: i64) -> Option<Upload> {
        lock(&self.inner)
            .uploads
            .iter()
            .find(|u| u.id == upload_id)
            .cloned()
    }

    pub fn all_uploads(&self) -> Vec<Upload> {
        lock(&self.inner).uploads.clone()
    }

    /// Overwrite a status without transition checks, emulating the state a
    /// crashed process left behind.
    pub fn force_status(&self, upload_id: i64, state: UploadState) {
        let mut inner = lock(&self.inner);
        if let Some(upload) = inner.uploads.iter_mut().find(|u| u.id == upload_id) {
            upload.status = state;
            upload.timings.push(state, Utc::now());
        }
    }

    /// Shift the first timing entry into the past.
    pub fn backdate_first_timing(&self, upload_id: i64, by: chrono::Duration) {
        let mut inner = lock(&self.inner);
        if let Some(upload) = inner.uploads.iter_mut().find(|u| u.id == upload_id) {
            if let Some(entry) = upload.timings.0.first_mut() {
                for at in entry.values_mut() {
                    *at -= by;
                }
            }
        }
    }
}

#[async_trait]
impl Journal for MemJournal {
    async fn insert_staging_file(&self, file: NewStagingFile) -> JournalResult<i64> {
        let mut inner = lock(&self.inner);
        inner.next_staging_id += 1;
        let id = inner.next_staging_id;
        inner.staging.push(StagingFile {
            id,
            location: file.location,
            source_id: file.source_id,
            destination_id: file.destination_id,
            schema: file.schema,
            status: StagingFileStatus::Waiting,
            total_events: file.total_events,
            first_event_at: file.first_event_at,
            last_event_at: file.last_event_at,
        });
        Ok(id)
    }

    async fn staging_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> JournalResult<Vec<StagingFile>> {
        Ok(lock(&self.inner)
            .staging
            .iter()
            .filter(|f| {
                f.source_id == source_id
                    && f.destination_id == destination_id
                    && f.id >= start_id
                    && f.id <= end_id
            })
            .cloned()
            .collect())
    }

    async fn latest_covered_staging_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Option<i64>> {
        Ok(lock(&self.inner)
            .uploads
            .iter()
            .filter(|u| u.source_id == source_id && u.destination_id == destination_id)
            .map(|u| u.end_staging_file_id)
            .max())
    }

    async fn pending_staging_files(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Vec<StagingFile>> {
        let last_covered = self
            .latest_covered_staging_id(source_id, destination_id)
            .await?
            .unwrap_or(0);
        Ok(lock(&self.inner)
            .staging
            .iter()
            .filter(|f| {
                f.source_id == source_id
                    && f.destination_id == destination_id
                    && f.id > last_covered
            })
            .cloned()
            .collect())
    }

    async fn mark_staging_files_consumed(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> JournalResult<()> {
        let mut inner = lock(&self.inner);
        for file in inner.staging.iter_mut() {
            if file.source_id == source_id
                && file.destination_id == destination_id
                && file.id >= start_id
                && file.id <= end_id
            {
                file.status = StagingFileStatus::Consumed;
            }
        }
        Ok(())
    }

    async fn insert_upload(
        &self,
        warehouse: &Warehouse,
        files: &[StagingFile],
    ) -> JournalResult<Upload> {
        let Some(first) = files.first() else {
            return Err(JournalError::Corrupt(
                "cannot create an upload over zero staging files".to_string(),
            ));
        };
        let last = files.last().unwrap_or(first);
        let mut inner = lock(&self.inner);
        inner.next_upload_id += 1;
        let upload = Upload {
            id: inner.next_upload_id,
            namespace: warehouse.namespace.clone(),
            source_id: warehouse.source_id.clone(),
            destination_id: warehouse.destination_id.clone(),
            destination_type: warehouse.destination_type,
            start_staging_file_id: first.id,
            end_staging_file_id: last.id,
            start_load_file_id: 0,
            end_load_file_id: 0,
            status: UploadState::Waiting,
            schema: WarehouseSchema::merged(files.iter().map(|f| &f.schema)),
            error: json!({}),
            timings: Timings::default(),
            first_event_at: first.first_event_at,
            last_event_at: last.last_event_at,
        };
        inner.uploads.push(upload.clone());
        Ok(upload)
    }

    async fn pending_uploads(
        &self,
        destination_type: DestinationType,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Vec<Upload>> {
        Ok(lock(&self.inner)
            .uploads
            .iter()
            .filter(|u| {
                u.destination_type == destination_type
                    && u.source_id == source_id
                    && u.destination_id == destination_id
                    && !u.status.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn set_upload_status(
        &self,
        upload_id: i64,
        state: UploadState,
        error: Option<&str>,
    ) -> JournalResult<()> {
        let mut inner = lock(&self.inner);
        let upload = inner
            .uploads
            .iter_mut()
            .find(|u| u.id == upload_id)
            .ok_or(JournalError::UploadNotFound(upload_id))?;
        if !upload.status.can_transition_to(state) {
            return Err(JournalError::InvalidTransition {
                upload_id,
                from: upload.status,
                to: state,
            });
        }
        upload.status = state;
        upload.timings.push(state, Utc::now());
        if let Some(message) = error {
            merge_error(&mut upload.error, state, message);
        }
        Ok(())
    }

    async fn set_load_file_range(
        &self,
        upload_id: i64,
        start_load_file_id: i64,
        end_load_file_id: i64,
    ) -> JournalResult<()> {
        let mut inner = lock(&self.inner);
        let upload = inner
            .uploads
            .iter_mut()
            .find(|u| u.id == upload_id)
            .ok_or(JournalError::UploadNotFound(upload_id))?;
        upload.start_load_file_id = start_load_file_id;
        upload.end_load_file_id = end_load_file_id;
        Ok(())
    }

    async fn init_table_uploads(&self, upload_id: i64, tables: &[String]) -> JournalResult<()> {
        let mut inner = lock(&self.inner);
        for table in tables {
            let exists = inner
                .table_uploads
                .iter()
                .any(|t| t.upload_id == upload_id && &t.table_name == table);
            if !exists {
                inner.table_uploads.push(TableUpload {
                    upload_id,
                    table_name: table.clone(),
                    status: TableUploadState::Waiting,
                    error: None,
                });
            }
        }
        Ok(())
    }

    async fn set_table_upload_status(
        &self,
        upload_id: i64,
        table_name: &str,
        state: TableUploadState,
        error: Option<&str>,
    ) -> JournalResult<()> {
        let mut inner = lock(&self.inner);
        match inner
            .table_uploads
            .iter_mut()
            .find(|t| t.upload_id == upload_id && t.table_name == table_name)
        {
            Some(table) => {
                table.status = state;
                table.error = error.map(String::from);
            }
            None => inner.table_uploads.push(TableUpload {
                upload_id,
                table_name: table_name.to_string(),
                status: state,
                error: error.map(String::from),
            }),
        }
        Ok(())
    }

    async fn table_uploads(&self, upload_id: i64) -> JournalResult<Vec<TableUpload>> {
        Ok(lock(&self.inner)
            .table_uploads
            .iter()
            .filter(|t| t.upload_id == upload_id)
            .cloned()
            .collect())
    }

    async fn schema_snapshot(
        &self,
        source_id: &str,
        destination_id: &str,
        namespace: &str,
    ) -> JournalResult<Option<WarehouseSchema>> {
        Ok(lock(&self.inner)
            .schemas
            .get(&(
                source_id.to_string(),
                destination_id.to_string(),
                namespace.to_string(),
            ))
            .cloned())
    }

    async fn update_schema_snapshot(
        &self,
        source_id: &str,
        destination_id: &str,
        namespace: &str,
        schema: &WarehouseSchema,
    ) -> JournalResult<()> {
        lock(&self.inner).schemas.insert(
            (
                source_id.to_string(),
                destination_id.to_string(),
                namespace.to_string(),
            ),
            schema.clone(),
        );
        Ok(())
    }

    async fn namespace_for(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Option<String>> {
        Ok(lock(&self.inner)
            .schemas
            .keys()
            .find(|(src, dst, _)| src == source_id && dst == destination_id)
            .map(|(_, _, namespace)| namespace.clone()))
    }

    async fn insert_load_files(&self, files: Vec<NewLoadFile>) -> JournalResult<()> {
        let mut inner = lock(&self.inner);
        for file in files {
            inner.next_load_file_id += 1;
            let id = inner.next_load_file_id;
            inner.load_files.push(LoadFile {
                id,
                staging_file_id: file.staging_file_id,
                location: file.location,
                table_name: file.table_name,
                total_events: file.total_events,
            });
        }
        Ok(())
    }

    async fn load_file_range(
        &self,
        start_staging_file_id: i64,
        end_staging_file_id: i64,
    ) -> JournalResult<Option<(i64, i64)>> {
        let inner = lock(&self.inner);
        let ids: Vec<i64> = inner
            .load_files
            .iter()
            .filter(|f| {
                f.staging_file_id >= start_staging_file_id
                    && f.staging_file_id <= end_staging_file_id
            })
            .map(|f| f.id)
            .collect();
        Ok(ids.iter().min().copied().zip(ids.iter().max().copied()))
    }

    async fn load_files_for_table(
        &self,
        table_name: &str,
        start_load_file_id: i64,
        end_load_file_id: i64,
    ) -> JournalResult<Vec<LoadFile>> {
        Ok(lock(&self.inner)
            .load_files
            .iter()
            .filter(|f| {
                f.table_name == table_name
                    && f.id >= start_load_file_id
                    && f.id <= end_load_file_id
            })
            .cloned()
            .collect())
    }

    async fn interrupted_destinations(
        &self,
        destination_type: DestinationType,
    ) -> JournalResult<Vec<String>> {
        let inner = lock(&self.inner);
        let mut ids: Vec<String> = inner
            .uploads
            .iter()
            .filter(|u| {
                u.destination_type == destination_type
                    && matches!(
                        u.status,
                        UploadState::ExportingData | UploadState::ExportingDataFailed
                    )
            })
            .map(|u| u.destination_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn healthy(&self) -> bool {
        true
    }
}

// ============================================================================
// Recording adapter
// ============================================================================

/// A call observed by the mock adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    TestConnection,
    CrashRecover,
    FetchSchema,
    CreateTable(String),
    AddColumn(String, String),
    LoadTable(String),
    LoadUsersTable,
}

impl MockCall {
    fn label(&self) -> String {
        match self {
            MockCall::TestConnection => "test_connection".to_string(),
            MockCall::CrashRecover => "crash_recover".to_string(),
            MockCall::FetchSchema => "fetch_schema".to_string(),
            MockCall::CreateTable(table) => format!("create_table:{table}"),
            MockCall::AddColumn(table, column) => format!("add_column:{table}.{column}"),
            MockCall::LoadTable(table) => format!("load_table:{table}"),
            MockCall::LoadUsersTable => "load_users_table".to_string(),
        }
    }
}

/// Recording adapter with injectable failures.
pub struct MockAdapter {
    destination_type: DestinationType,
    max_parallel_loads: usize,
    load_delay: Duration,
    calls: Mutex<Vec<MockCall>>,
    load_failures: Mutex<HashMap<String, usize>>,
    already_exists_tables: Mutex<Vec<String>>,
    concurrent_loads: AtomicUsize,
    max_concurrent_loads: AtomicUsize,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            destination_type: DestinationType::Postgres,
            max_parallel_loads: 4,
            load_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            load_failures: Mutex::new(HashMap::new()),
            already_exists_tables: Mutex::new(Vec::new()),
            concurrent_loads: AtomicUsize::new(0),
            max_concurrent_loads: AtomicUsize::new(0),
        }
    }

    pub fn with_destination_type(mut self, destination_type: DestinationType) -> Self {
        self.destination_type = destination_type;
        self
    }

    pub fn with_max_parallel_loads(mut self, max: usize) -> Self {
        self.max_parallel_loads = max;
        self
    }

    pub fn with_load_delay_ms(mut self, millis: u64) -> Self {
        self.load_delay = Duration::from_millis(millis);
        self
    }

    /// Fail the next `times` loads of `table` with a transient error.
    pub fn fail_load_table(&self, table: &str, times: usize) {
        lock(&self.load_failures).insert(table.to_string(), times);
    }

    pub fn clear_failures(&self) {
        lock(&self.load_failures).clear();
    }

    /// Answer `create_table` for `table` with an already-exists error.
    pub fn fail_create_table_with_already_exists(&self, table: &str) {
        lock(&self.already_exists_tables).push(table.to_string());
    }

    pub fn count(&self, call: MockCall) -> usize {
        lock(&self.calls).iter().filter(|c| **c == call).count()
    }

    pub fn total_add_columns(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, MockCall::AddColumn(_, _)))
            .count()
    }

    /// Every recorded call, in order, as compact labels.
    pub fn call_sequence(&self) -> Vec<String> {
        lock(&self.calls).iter().map(MockCall::label).collect()
    }

    /// Load calls only: table names, with `users:merge` for the merge path.
    pub fn load_sequence(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                MockCall::LoadTable(table) => Some(table.clone()),
                MockCall::LoadUsersTable => Some("users:merge".to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn max_concurrent_loads(&self) -> usize {
        self.max_concurrent_loads.load(Ordering::SeqCst)
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    fn take_load_failure(&self, table: &str) -> bool {
        let mut failures = lock(&self.load_failures);
        match failures.get_mut(table) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn simulate_load(&self) {
        let current = self.concurrent_loads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_loads.fetch_max(current, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.concurrent_loads.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WarehouseAdapter for MockAdapter {
    fn destination_type(&self) -> DestinationType {
        self.destination_type
    }

    fn max_parallel_loads(&self) -> usize {
        self.max_parallel_loads
    }

    async fn test_connection(&self, _warehouse: &Warehouse) -> Result<(), AdapterError> {
        self.record(MockCall::TestConnection);
        Ok(())
    }

    async fn crash_recover(&self, _warehouse: &Warehouse) -> Result<(), AdapterError> {
        self.record(MockCall::CrashRecover);
        Ok(())
    }

    async fn fetch_schema(&self, _warehouse: &Warehouse) -> Result<WarehouseSchema, AdapterError> {
        self.record(MockCall::FetchSchema);
        Ok(WarehouseSchema::new())
    }

    async fn create_table(
        &self,
        _warehouse: &Warehouse,
        table: &str,
        _columns: &crate::schema::TableSchema,
    ) -> Result<(), AdapterError> {
        self.record(MockCall::CreateTable(table.to_string()));
        if lock(&self.already_exists_tables).iter().any(|t| t == table) {
            return Err(AdapterError::AlreadyExists {
                object: format!("table {table}"),
            });
        }
        Ok(())
    }

    async fn add_column(
        &self,
        _warehouse: &Warehouse,
        table: &str,
        column: &str,
        _column_type: crate::schema::ColumnType,
    ) -> Result<(), AdapterError> {
        self.record(MockCall::AddColumn(table.to_string(), column.to_string()));
        Ok(())
    }

    async fn load_table(
        &self,
        _warehouse: &Warehouse,
        table: &str,
        _load_files: &[LoadFile],
        _force_load: bool,
    ) -> Result<(), AdapterError> {
        self.record(MockCall::LoadTable(table.to_string()));
        self.simulate_load().await;
        if self.take_load_failure(table) {
            return Err(AdapterError::Query(format!("simulated failure loading {table}")));
        }
        Ok(())
    }

    async fn load_users_table(
        &self,
        _warehouse: &Warehouse,
        _load_files: &[LoadFile],
    ) -> Result<(), AdapterError> {
        self.record(MockCall::LoadUsersTable);
        self.simulate_load().await;
        if self.take_load_failure(crate::job::USERS_TABLE) {
            return Err(AdapterError::Query("simulated failure loading users".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub mod fixtures {
    use super::*;
    use crate::dispatcher::{Dispatcher, DispatcherConfig, OrchestratorState};
    use crate::job::UploadJob;
    use crate::worker::{spawn_worker, WorkerConfig};

    /// Dispatcher config for tests: no frequency gate, generous retries.
    pub fn dispatcher_config() -> DispatcherConfig {
        DispatcherConfig {
            main_loop_sleep: Duration::from_millis(10),
            upload_freq: Duration::ZERO,
            sync_freq_ignore: false,
            staging_files_batch_size: 240,
            min_retry_attempts: 3,
            retry_time_window: Duration::from_secs(3600),
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            no_of_workers: 8,
            retry_sleep: Duration::from_millis(5),
            queue_depth: 100,
        }
    }

    /// One warehouse, one in-memory journal, one orchestrator state.
    pub struct Harness {
        journal: Arc<MemJournal>,
        state: Arc<OrchestratorState>,
        warehouse: Warehouse,
    }

    impl Harness {
        pub fn new() -> Self {
            Self {
                journal: Arc::new(MemJournal::new()),
                state: Arc::new(OrchestratorState::new()),
                warehouse: Warehouse {
                    source_id: "src-1".to_string(),
                    source_name: "Test Source".to_string(),
                    destination_id: "dst-1".to_string(),
                    destination_type: DestinationType::Postgres,
                    namespace: "analytics".to_string(),
                    enabled: true,
                    sync_frequency_secs: None,
                },
            }
        }

        pub fn with_staging_id_base(self, base: i64) -> Self {
            self.journal.set_next_staging_id(base);
            self
        }

        pub fn with_destination_type(mut self, destination_type: DestinationType) -> Self {
            self.warehouse.destination_type = destination_type;
            self
        }

        pub fn with_disabled_warehouse(mut self) -> Self {
            self.warehouse.enabled = false;
            self
        }

        pub fn journal(&self) -> Arc<MemJournal> {
            self.journal.clone()
        }

        pub fn state(&self) -> Arc<OrchestratorState> {
            self.state.clone()
        }

        pub fn warehouse(&self) -> Warehouse {
            self.warehouse.clone()
        }

        /// Dispatcher over this harness's warehouse with a live worker.
        pub fn dispatcher(
            &self,
            adapter: Arc<MockAdapter>,
            config: DispatcherConfig,
        ) -> Dispatcher {
            self.state.set_warehouses(
                self.warehouse.destination_type,
                vec![self.warehouse.clone()],
            );
            let worker_id = self.warehouse.worker_id();
            if !self.state.has_worker(&worker_id) {
                let sender = spawn_worker(worker_id.clone(), self.state.clone(), worker_config());
                self.state.register_worker(&worker_id, sender);
            }
            Dispatcher::new(
                self.warehouse.destination_type,
                self.journal.clone(),
                adapter,
                config,
                self.state.clone(),
            )
        }

        /// Journal `count` staging files, optionally with one load file per
        /// table per staging file.
        pub async fn announce_staging_files(
            &self,
            count: usize,
            tables: &[(&str, &[(&str, &str)])],
            with_load_files: bool,
        ) -> Vec<i64> {
            let schema = schema_from(tables);
            let mut ids = Vec::new();
            for i in 0..count {
                let id = self
                    .journal
                    .insert_staging_file(NewStagingFile {
                        location: format!("s3://staging/{i}.json.gz"),
                        source_id: self.warehouse.source_id.clone(),
                        destination_id: self.warehouse.destination_id.clone(),
                        schema: schema.clone(),
                        total_events: 100,
                        first_event_at: Some(Utc::now()),
                        last_event_at: Some(Utc::now()),
                    })
                    .await
                    .unwrap();
                if with_load_files {
                    let load_files = tables
                        .iter()
                        .map(|(table, _)| NewLoadFile {
                            staging_file_id: id,
                            location: format!("s3://load/{table}/{i}.csv.gz"),
                            table_name: table.to_string(),
                            total_events: 100,
                        })
                        .collect();
                    self.journal.insert_load_files(load_files).await.unwrap();
                }
                ids.push(id);
            }
            ids
        }

        /// One upload over freshly announced staging files.
        pub async fn seed_upload(
            &self,
            tables: &[(&str, &[(&str, &str)])],
            with_load_files: bool,
        ) -> i64 {
            let ids = self.announce_staging_files(2, tables, with_load_files).await;
            let files = self
                .journal
                .staging_files_in_range(
                    &self.warehouse.source_id,
                    &self.warehouse.destination_id,
                    ids[0],
                    ids[ids.len() - 1],
                )
                .await
                .unwrap();
            self.journal
                .insert_upload(&self.warehouse, &files)
                .await
                .unwrap()
                .id
        }

        pub async fn job_for_upload(&self, upload_id: i64, adapter: Arc<MockAdapter>) -> UploadJob {
            let upload = self.journal.get_upload(upload_id).unwrap();
            let staging_files = self
                .journal
                .staging_files_in_range(
                    &upload.source_id,
                    &upload.destination_id,
                    upload.start_staging_file_id,
                    upload.end_staging_file_id,
                )
                .await
                .unwrap();
            UploadJob::new(
                upload,
                staging_files,
                self.warehouse.clone(),
                self.journal.clone(),
                adapter,
            )
        }

        pub async fn upload(&self, upload_id: i64) -> Upload {
            self.journal.get_upload(upload_id).unwrap()
        }

        pub async fn only_upload_id(&self) -> i64 {
            let uploads = self.journal.all_uploads();
            assert_eq!(uploads.len(), 1, "expected exactly one upload");
            uploads[0].id
        }

        pub async fn upload_ranges(&self) -> Vec<(i64, i64)> {
            self.journal
                .all_uploads()
                .iter()
                .map(|u| (u.start_staging_file_id, u.end_staging_file_id))
                .collect()
        }

        pub async fn table_uploads(&self, upload_id: i64) -> Vec<TableUpload> {
            self.journal.table_uploads(upload_id).await.unwrap()
        }

        pub async fn snapshot(&self) -> Option<WarehouseSchema> {
            self.journal
                .schema_snapshot(
                    &self.warehouse.source_id,
                    &self.warehouse.destination_id,
                    &self.warehouse.namespace,
                )
                .await
                .unwrap()
        }

        pub async fn force_status(&self, upload_id: i64, state: UploadState) {
            self.journal.force_status(upload_id, state);
        }

        /// Persist a load-file range as if the accounting phase had run.
        pub async fn force_load_file_range(&self, upload_id: i64, start: i64, end: i64) {
            self.journal
                .set_load_file_range(upload_id, start, end)
                .await
                .unwrap();
        }

        pub async fn backdate_first_timing(&self, upload_id: i64, by: chrono::Duration) {
            self.journal.backdate_first_timing(upload_id, by);
        }

        pub async fn wait_until(&self, predicate: impl Fn() -> bool, timeout: Duration) {
            let deadline = tokio::time::Instant::now() + timeout;
            while !predicate() {
                if tokio::time::Instant::now() >= deadline {
                    panic!("condition not met within {timeout:?}");
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        pub async fn wait_until_uploads(
            &self,
            predicate: impl Fn(&[Upload]) -> bool,
            timeout: Duration,
        ) {
            let journal = self.journal.clone();
            self.wait_until(move || predicate(&journal.all_uploads()), timeout)
                .await;
        }

        pub async fn wait_for_status(
            &self,
            upload_id: i64,
            status: UploadState,
            timeout: Duration,
        ) {
            let journal = self.journal.clone();
            self.wait_until(
                move || {
                    journal
                        .get_upload(upload_id)
                        .map(|u| u.status == status)
                        .unwrap_or(false)
                },
                timeout,
            )
            .await;
        }

        pub async fn wait_for_single_upload(&self, status: UploadState, timeout: Duration) -> i64 {
            self.wait_until_uploads(
                move |uploads| uploads.len() == 1 && uploads[0].status == status,
                timeout,
            )
            .await;
            self.only_upload_id().await
        }

        pub async fn wait_for_all_uploads(
            &self,
            status: UploadState,
            count: usize,
            timeout: Duration,
        ) {
            self.wait_until_uploads(
                move |uploads| {
                    uploads.len() == count && uploads.iter().all(|u| u.status == status)
                },
                timeout,
            )
            .await;
        }

        pub async fn wait_for_attempts(&self, attempts: i64, timeout: Duration) {
            let journal = self.journal.clone();
            self.wait_until(
                move || {
                    journal
                        .all_uploads()
                        .first()
                        .map(|u| u.attempts() >= attempts)
                        .unwrap_or(false)
                },
                timeout,
            )
            .await;
        }

        /// Wait until no pair is claimed and no worker slot is held.
        pub async fn wait_for_idle(&self, timeout: Duration) {
            let state = self.state.clone();
            let key = self.warehouse.connection_key();
            self.wait_until(
                move || !state.is_in_progress(&key) && state.active_workers() == 0,
                timeout,
            )
            .await;
        }
    }

    /// Build a schema literal from `(table, [(column, type)])` pairs.
    pub fn schema_from(tables: &[(&str, &[(&str, &str)])]) -> WarehouseSchema {
        let mut value = serde_json::Map::new();
        for (table, columns) in tables {
            let columns: serde_json::Map<String, serde_json::Value> = columns
                .iter()
                .map(|(column, ty)| (column.to_string(), json!(ty)))
                .collect();
            value.insert(table.to_string(), serde_json::Value::Object(columns));
        }
        serde_json::from_value(serde_json::Value::Object(value)).unwrap()
    }
}
