//! Core domain types
//!
//! Rows of the journal plus the in-memory view of an active destination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schema::WarehouseSchema;
use crate::state::{TableUploadState, UploadState};

/// Supported destination warehouse kinds.
///
/// The short codes are the journal's `destination_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationType {
    #[serde(rename = "BQ")]
    BigQuery,
    #[serde(rename = "RS")]
    Redshift,
    #[serde(rename = "SNOWFLAKE")]
    Snowflake,
    #[serde(rename = "POSTGRES")]
    Postgres,
    #[serde(rename = "CLICKHOUSE")]
    Clickhouse,
}

impl DestinationType {
    pub const ALL: [DestinationType; 5] = [
        DestinationType::BigQuery,
        DestinationType::Redshift,
        DestinationType::Snowflake,
        DestinationType::Postgres,
        DestinationType::Clickhouse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DestinationType::BigQuery => "BQ",
            DestinationType::Redshift => "RS",
            DestinationType::Snowflake => "SNOWFLAKE",
            DestinationType::Postgres => "POSTGRES",
            DestinationType::Clickhouse => "CLICKHOUSE",
        }
    }

    /// Destinations that leave transient artifacts (staged files, temp
    /// tables) an interrupted run must clean up before new work.
    pub fn crash_recoverable(self) -> bool {
        matches!(self, DestinationType::Redshift)
    }
}

impl std::str::FromStr for DestinationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BQ" => Ok(DestinationType::BigQuery),
            "RS" => Ok(DestinationType::Redshift),
            "SNOWFLAKE" => Ok(DestinationType::Snowflake),
            "POSTGRES" => Ok(DestinationType::Postgres),
            "CLICKHOUSE" => Ok(DestinationType::Clickhouse),
            other => Err(format!("unknown destination type: {other}")),
        }
    }
}

impl std::fmt::Display for DestinationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Staging-file lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingFileStatus {
    Waiting,
    Consumed,
}

impl StagingFileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StagingFileStatus::Waiting => "waiting",
            StagingFileStatus::Consumed => "consumed",
        }
    }
}

impl std::str::FromStr for StagingFileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(StagingFileStatus::Waiting),
            "consumed" => Ok(StagingFileStatus::Consumed),
            other => Err(format!("unknown staging file status: {other}")),
        }
    }
}

/// A staging-file descriptor announced by an upstream producer.
///
/// Immutable once journaled, except for its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingFile {
    pub id: i64,
    pub location: String,
    pub source_id: String,
    pub destination_id: String,
    pub schema: WarehouseSchema,
    pub status: StagingFileStatus,
    pub total_events: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Fields of a staging file not yet assigned an id by the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStagingFile {
    pub location: String,
    pub source_id: String,
    pub destination_id: String,
    pub schema: WarehouseSchema,
    pub total_events: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// A warehouse-ready serialization derived from staging files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadFile {
    pub id: i64,
    pub staging_file_id: i64,
    pub location: String,
    pub table_name: String,
    pub total_events: i64,
}

/// Fields of a load file not yet assigned an id by the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLoadFile {
    pub staging_file_id: i64,
    pub location: String,
    pub table_name: String,
    pub total_events: i64,
}

/// Ordered record of every state transition an upload went through, as an
/// append-only list of `{state: timestamp}` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timings(pub Vec<BTreeMap<String, DateTime<Utc>>>);

impl Timings {
    pub fn push(&mut self, state: UploadState, at: DateTime<Utc>) {
        let mut entry = BTreeMap::new();
        entry.insert(state.as_str().to_string(), at);
        self.0.push(entry);
    }

    fn entry_at(&self, index: usize) -> Option<(&str, DateTime<Utc>)> {
        self.0
            .get(index)
            .and_then(|entry| entry.iter().next())
            .map(|(state, at)| (state.as_str(), *at))
    }

    /// First recorded transition; the upload's first attempt.
    pub fn first(&self) -> Option<(&str, DateTime<Utc>)> {
        self.entry_at(0)
    }

    /// Most recent recorded transition.
    pub fn last(&self) -> Option<(&str, DateTime<Utc>)> {
        self.entry_at(self.0.len().wrapping_sub(1))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A unit of work covering a contiguous id-range of staging files for one
/// `(source, destination)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: i64,
    pub namespace: String,
    pub source_id: String,
    pub destination_id: String,
    pub destination_type: DestinationType,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub start_load_file_id: i64,
    pub end_load_file_id: i64,
    pub status: UploadState,
    pub schema: WarehouseSchema,
    /// Error details keyed by the state they occurred in:
    /// `{"<state>": {"attempt": n, "errors": [..]}}`.
    pub error: serde_json::Value,
    pub timings: Timings,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Upload {
    /// Attempts charged against the retry gate: the attempt counter stored
    /// under the state of the most recent transition.
    pub fn attempts(&self) -> i64 {
        let Some((state, _)) = self.timings.last() else {
            return 0;
        };
        self.error
            .get(state)
            .and_then(|e| e.get("attempt"))
            .and_then(|a| a.as_i64())
            .unwrap_or(0)
    }

    /// When this upload was first picked up by a worker.
    pub fn first_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.timings.first().map(|(_, at)| at)
    }

    /// Errors recorded for `state`, if any.
    pub fn errors_for(&self, state: UploadState) -> Vec<String> {
        self.error
            .get(state.as_str())
            .and_then(|e| e.get("errors"))
            .and_then(|e| e.as_array())
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(|e| e.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Per-table progress of one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableUpload {
    pub upload_id: i64,
    pub table_name: String,
    pub status: TableUploadState,
    pub error: Option<String>,
}

/// An active `(source, destination)` pair materialized from the control
/// plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warehouse {
    pub source_id: String,
    pub source_name: String,
    pub destination_id: String,
    pub destination_type: DestinationType,
    pub namespace: String,
    pub enabled: bool,
    /// Per-destination override of the upload-frequency gate, in seconds.
    pub sync_frequency_secs: Option<i64>,
}

impl Warehouse {
    /// Key under which the in-progress claim and last-exec time are held.
    pub fn connection_key(&self) -> String {
        format!("source:{}:destination:{}", self.source_id, self.destination_id)
    }

    /// Worker identity; one worker serves each `(destination, namespace)`.
    pub fn worker_id(&self) -> String {
        format!("{}_{}", self.destination_id, self.namespace)
    }

    /// Human-facing identity for logs.
    pub fn identifier(&self) -> String {
        format!(
            "{}:{}:{}",
            self.destination_type, self.source_id, self.destination_id
        )
    }
}
