//! Journal store
//!
//! The durable record the whole engine hangs off: staging files announced
//! by producers, uploads and their per-table progress, schema snapshots,
//! and the load-file ledger written by out-of-process producers.
//!
//! Every mutating helper is idempotent when re-applied after a crash, and
//! readers tolerate partial progress (a table upload left `executing` with
//! no warehouse-side effect). Status regressions are rejected as invariant
//! violations; the caller is expected to treat those as fatal.

pub mod pg;

pub use pg::PgJournal;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    DestinationType, LoadFile, NewLoadFile, NewStagingFile, StagingFile, TableUpload, Upload,
    Warehouse,
};
use crate::schema::WarehouseSchema;
use crate::state::{TableUploadState, UploadState};

/// Result type alias for journal operations
pub type JournalResult<T> = std::result::Result<T, JournalError>;

/// Journal error types
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Upload {0} not found")]
    UploadNotFound(i64),

    #[error("Illegal status transition for upload {upload_id}: {from} -> {to}")]
    InvalidTransition {
        upload_id: i64,
        from: UploadState,
        to: UploadState,
    },

    #[error("Journal row is malformed: {0}")]
    Corrupt(String),
}

impl JournalError {
    /// Invariant violations terminate the process so that restart-driven
    /// recovery re-observes a consistent snapshot.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JournalError::InvalidTransition { .. } | JournalError::Corrupt(_)
        )
    }
}

/// Strongly typed access to the warehouse journal.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append a staging-file row in state `waiting`; returns its id.
    async fn insert_staging_file(&self, file: NewStagingFile) -> JournalResult<i64>;

    /// Staging files of a pair within `[start_id, end_id]`, ordered by id.
    async fn staging_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> JournalResult<Vec<StagingFile>>;

    /// Highest staging-file id already covered by any upload of the pair,
    /// regardless of upload state; the lower bound for pending staging
    /// files.
    async fn latest_covered_staging_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Option<i64>>;

    /// Staging files of a pair newer than any upload's range, ordered by id.
    async fn pending_staging_files(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Vec<StagingFile>>;

    /// Mark a consumed range of staging files.
    async fn mark_staging_files_consumed(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> JournalResult<()>;

    /// Create an upload in state `waiting` covering `files`, with the
    /// merged schema of those files.
    async fn insert_upload(
        &self,
        warehouse: &Warehouse,
        files: &[StagingFile],
    ) -> JournalResult<Upload>;

    /// Non-terminal uploads of a pair, ordered by id.
    async fn pending_uploads(
        &self,
        destination_type: DestinationType,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Vec<Upload>>;

    /// Transition an upload, appending to its timings atomically with the
    /// status. When `error` is given it is recorded under the new state's
    /// key and that state's attempt counter is bumped.
    async fn set_upload_status(
        &self,
        upload_id: i64,
        state: UploadState,
        error: Option<&str>,
    ) -> JournalResult<()>;

    /// Persist the load-file id range the upload covers.
    async fn set_load_file_range(
        &self,
        upload_id: i64,
        start_load_file_id: i64,
        end_load_file_id: i64,
    ) -> JournalResult<()>;

    /// Create missing table-upload rows in state `waiting`; existing rows
    /// are left untouched.
    async fn init_table_uploads(&self, upload_id: i64, tables: &[String]) -> JournalResult<()>;

    /// Upsert the status (and error) of one table of an upload.
    async fn set_table_upload_status(
        &self,
        upload_id: i64,
        table_name: &str,
        state: TableUploadState,
        error: Option<&str>,
    ) -> JournalResult<()>;

    /// All table-upload rows of an upload.
    async fn table_uploads(&self, upload_id: i64) -> JournalResult<Vec<TableUpload>>;

    /// Current schema snapshot for `(source, destination, namespace)`.
    async fn schema_snapshot(
        &self,
        source_id: &str,
        destination_id: &str,
        namespace: &str,
    ) -> JournalResult<Option<WarehouseSchema>>;

    /// Replace the schema snapshot.
    async fn update_schema_snapshot(
        &self,
        source_id: &str,
        destination_id: &str,
        namespace: &str,
        schema: &WarehouseSchema,
    ) -> JournalResult<()>;

    /// Namespace previously journaled for a pair, if any.
    async fn namespace_for(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Option<String>>;

    /// Append load-file rows (written by the producers).
    async fn insert_load_files(&self, files: Vec<NewLoadFile>) -> JournalResult<()>;

    /// Smallest and largest load-file id derived from the staging range,
    /// or `None` when no load files exist yet.
    async fn load_file_range(
        &self,
        start_staging_file_id: i64,
        end_staging_file_id: i64,
    ) -> JournalResult<Option<(i64, i64)>>;

    /// Load files of one table within `[start_id, end_id]`.
    async fn load_files_for_table(
        &self,
        table_name: &str,
        start_load_file_id: i64,
        end_load_file_id: i64,
    ) -> JournalResult<Vec<LoadFile>>;

    /// Destinations of a type that had an upload in `exporting_data` or
    /// `exporting_data_failed`, i.e. candidates for crash recovery.
    async fn interrupted_destinations(
        &self,
        destination_type: DestinationType,
    ) -> JournalResult<Vec<String>>;

    /// Cheap connectivity probe for the health endpoint.
    async fn healthy(&self) -> bool;
}
