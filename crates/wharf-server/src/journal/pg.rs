//! Postgres journal implementation

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::{PgPool, Row};

use super::{Journal, JournalError, JournalResult};
use crate::model::{
    DestinationType, LoadFile, NewLoadFile, NewStagingFile, StagingFile, StagingFileStatus,
    TableUpload, Timings, Upload, Warehouse,
};
use crate::schema::WarehouseSchema;
use crate::state::{TableUploadState, UploadState};

/// Journal backed by the `wh_*` tables.
#[derive(Clone)]
pub struct PgJournal {
    pool: PgPool,
}

impl PgJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_state(raw: &str, upload_id: i64) -> JournalResult<UploadState> {
    raw.parse()
        .map_err(|e| JournalError::Corrupt(format!("upload {upload_id}: {e}")))
}

fn staging_file_from_row(row: &sqlx::postgres::PgRow) -> JournalResult<StagingFile> {
    let status: String = row.try_get("status")?;
    let schema: serde_json::Value = row.try_get("schema")?;
    Ok(StagingFile {
        id: row.try_get("id")?,
        location: row.try_get("location")?,
        source_id: row.try_get("source_id")?,
        destination_id: row.try_get("destination_id")?,
        schema: serde_json::from_value(schema)?,
        status: status
            .parse::<StagingFileStatus>()
            .map_err(JournalError::Corrupt)?,
        total_events: row.try_get("total_events")?,
        first_event_at: row.try_get("first_event_at")?,
        last_event_at: row.try_get("last_event_at")?,
    })
}

fn upload_from_row(row: &sqlx::postgres::PgRow) -> JournalResult<Upload> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let destination_type: String = row.try_get("destination_type")?;
    let schema: serde_json::Value = row.try_get("schema")?;
    let timings: serde_json::Value = row.try_get("timings")?;
    Ok(Upload {
        id,
        namespace: row.try_get("namespace")?,
        source_id: row.try_get("source_id")?,
        destination_id: row.try_get("destination_id")?,
        destination_type: destination_type
            .parse::<DestinationType>()
            .map_err(JournalError::Corrupt)?,
        start_staging_file_id: row.try_get("start_staging_file_id")?,
        end_staging_file_id: row.try_get("end_staging_file_id")?,
        start_load_file_id: row.try_get("start_load_file_id")?,
        end_load_file_id: row.try_get("end_load_file_id")?,
        status: parse_state(&status, id)?,
        schema: serde_json::from_value(schema)?,
        error: row.try_get("error")?,
        timings: serde_json::from_value(timings)?,
        first_event_at: row.try_get("first_event_at")?,
        last_event_at: row.try_get("last_event_at")?,
    })
}

const UPLOAD_COLUMNS: &str = "id, source_id, namespace, destination_id, destination_type, \
     start_staging_file_id, end_staging_file_id, start_load_file_id, end_load_file_id, \
     status, schema, error, timings, first_event_at, last_event_at";

#[async_trait]
impl Journal for PgJournal {
    async fn insert_staging_file(&self, file: NewStagingFile) -> JournalResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO wh_staging_files
                (location, source_id, destination_id, schema, status, total_events,
                 first_event_at, last_event_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&file.location)
        .bind(&file.source_id)
        .bind(&file.destination_id)
        .bind(serde_json::to_value(&file.schema)?)
        .bind(StagingFileStatus::Waiting.as_str())
        .bind(file.total_events)
        .bind(file.first_event_at)
        .bind(file.last_event_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn staging_files_in_range(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> JournalResult<Vec<StagingFile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, location, source_id, destination_id, schema, status, total_events,
                   first_event_at, last_event_at
            FROM wh_staging_files
            WHERE source_id = $1 AND destination_id = $2 AND id >= $3 AND id <= $4
            ORDER BY id ASC
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(start_id)
        .bind(end_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(staging_file_from_row).collect()
    }

    async fn latest_covered_staging_id(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Option<i64>> {
        let latest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(end_staging_file_id)
            FROM wh_uploads
            WHERE source_id = $1 AND destination_id = $2
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn pending_staging_files(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Vec<StagingFile>> {
        let last_covered = self
            .latest_covered_staging_id(source_id, destination_id)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, location, source_id, destination_id, schema, status, total_events,
                   first_event_at, last_event_at
            FROM wh_staging_files
            WHERE source_id = $1 AND destination_id = $2 AND id > $3
            ORDER BY id ASC
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(last_covered.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(staging_file_from_row).collect()
    }

    async fn mark_staging_files_consumed(
        &self,
        source_id: &str,
        destination_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> JournalResult<()> {
        sqlx::query(
            r#"
            UPDATE wh_staging_files
            SET status = $1, updated_at = now()
            WHERE source_id = $2 AND destination_id = $3 AND id >= $4 AND id <= $5
            "#,
        )
        .bind(StagingFileStatus::Consumed.as_str())
        .bind(source_id)
        .bind(destination_id)
        .bind(start_id)
        .bind(end_id)
        .execute(&self.pool)
        .await?;
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
        let schema = WarehouseSchema::merged(files.iter().map(|f| &f.schema));

        let row = sqlx::query(
            r#"
            INSERT INTO wh_uploads
                (source_id, namespace, destination_id, destination_type,
                 start_staging_file_id, end_staging_file_id,
                 start_load_file_id, end_load_file_id,
                 status, schema, error, timings, first_event_at, last_event_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, 0, $7, $8, '{}', '[]', $9, $10)
            RETURNING id
            "#,
        )
        .bind(&warehouse.source_id)
        .bind(&warehouse.namespace)
        .bind(&warehouse.destination_id)
        .bind(warehouse.destination_type.as_str())
        .bind(first.id)
        .bind(last.id)
        .bind(UploadState::Waiting.as_str())
        .bind(serde_json::to_value(&schema)?)
        .bind(first.first_event_at)
        .bind(last.last_event_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Upload {
            id: row.try_get("id")?,
            namespace: warehouse.namespace.clone(),
            source_id: warehouse.source_id.clone(),
            destination_id: warehouse.destination_id.clone(),
            destination_type: warehouse.destination_type,
            start_staging_file_id: first.id,
            end_staging_file_id: last.id,
            start_load_file_id: 0,
            end_load_file_id: 0,
            status: UploadState::Waiting,
            schema,
            error: json!({}),
            timings: Timings::default(),
            first_event_at: first.first_event_at,
            last_event_at: last.last_event_at,
        })
    }

    async fn pending_uploads(
        &self,
        destination_type: DestinationType,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Vec<Upload>> {
        let sql = format!(
            r#"
            SELECT {UPLOAD_COLUMNS}
            FROM wh_uploads
            WHERE destination_type = $1 AND source_id = $2 AND destination_id = $3
              AND status <> $4 AND status <> $5
            ORDER BY id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(destination_type.as_str())
            .bind(source_id)
            .bind(destination_id)
            .bind(UploadState::ExportedData.as_str())
            .bind(UploadState::Aborted.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(upload_from_row).collect()
    }

    async fn set_upload_status(
        &self,
        upload_id: i64,
        state: UploadState,
        error: Option<&str>,
    ) -> JournalResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, error, timings FROM wh_uploads WHERE id = $1 FOR UPDATE",
        )
        .bind(upload_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(JournalError::UploadNotFound(upload_id))?;

        let current_raw: String = row.try_get("status")?;
        let current = parse_state(&current_raw, upload_id)?;
        if !current.can_transition_to(state) {
            return Err(JournalError::InvalidTransition {
                upload_id,
                from: current,
                to: state,
            });
        }

        let mut timings: Timings = serde_json::from_value(row.try_get("timings")?)?;
        timings.push(state, Utc::now());

        let mut error_blob: serde_json::Value = row.try_get("error")?;
        if let Some(message) = error {
            merge_error(&mut error_blob, state, message);
        }

        sqlx::query(
            r#"
            UPDATE wh_uploads
            SET status = $2, timings = $3, error = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(upload_id)
        .bind(state.as_str())
        .bind(serde_json::to_value(&timings)?)
        .bind(error_blob)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_load_file_range(
        &self,
        upload_id: i64,
        start_load_file_id: i64,
        end_load_file_id: i64,
    ) -> JournalResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE wh_uploads
            SET start_load_file_id = $2, end_load_file_id = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(upload_id)
        .bind(start_load_file_id)
        .bind(end_load_file_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(JournalError::UploadNotFound(upload_id));
        }
        Ok(())
    }

    async fn init_table_uploads(&self, upload_id: i64, tables: &[String]) -> JournalResult<()> {
        for table in tables {
            sqlx::query(
                r#"
                INSERT INTO wh_table_uploads (wh_upload_id, table_name, status)
                VALUES ($1, $2, $3)
                ON CONFLICT (wh_upload_id, table_name) DO NOTHING
                "#,
            )
            .bind(upload_id)
            .bind(table)
            .bind(TableUploadState::Waiting.as_str())
            .execute(&self.pool)
            .await?;
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
        sqlx::query(
            r#"
            INSERT INTO wh_table_uploads (wh_upload_id, table_name, status, error)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (wh_upload_id, table_name)
            DO UPDATE SET status = $3, error = $4, updated_at = now()
            "#,
        )
        .bind(upload_id)
        .bind(table_name)
        .bind(state.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn table_uploads(&self, upload_id: i64) -> JournalResult<Vec<TableUpload>> {
        let rows = sqlx::query(
            r#"
            SELECT wh_upload_id, table_name, status, error
            FROM wh_table_uploads
            WHERE wh_upload_id = $1
            ORDER BY table_name ASC
            "#,
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(TableUpload {
                    upload_id: row.try_get("wh_upload_id")?,
                    table_name: row.try_get("table_name")?,
                    status: status
                        .parse::<TableUploadState>()
                        .map_err(JournalError::Corrupt)?,
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }

    async fn schema_snapshot(
        &self,
        source_id: &str,
        destination_id: &str,
        namespace: &str,
    ) -> JournalResult<Option<WarehouseSchema>> {
        let row = sqlx::query(
            r#"
            SELECT schema FROM wh_schemas
            WHERE source_id = $1 AND destination_id = $2 AND namespace = $3
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let schema: serde_json::Value = row.try_get("schema")?;
                Ok(Some(serde_json::from_value(schema)?))
            }
            None => Ok(None),
        }
    }

    async fn update_schema_snapshot(
        &self,
        source_id: &str,
        destination_id: &str,
        namespace: &str,
        schema: &WarehouseSchema,
    ) -> JournalResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wh_schemas (source_id, destination_id, namespace, schema)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id, destination_id, namespace)
            DO UPDATE SET schema = $4, updated_at = now()
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .bind(namespace)
        .bind(serde_json::to_value(schema)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn namespace_for(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> JournalResult<Option<String>> {
        let namespace: Option<String> = sqlx::query_scalar(
            r#"
            SELECT namespace FROM wh_schemas
            WHERE source_id = $1 AND destination_id = $2
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(namespace)
    }

    async fn insert_load_files(&self, files: Vec<NewLoadFile>) -> JournalResult<()> {
        for file in files {
            sqlx::query(
                r#"
                INSERT INTO wh_load_files (staging_file_id, location, table_name, total_events)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(file.staging_file_id)
            .bind(&file.location)
            .bind(&file.table_name)
            .bind(file.total_events)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn load_file_range(
        &self,
        start_staging_file_id: i64,
        end_staging_file_id: i64,
    ) -> JournalResult<Option<(i64, i64)>> {
        let row = sqlx::query(
            r#"
            SELECT MIN(id) AS start_id, MAX(id) AS end_id
            FROM wh_load_files
            WHERE staging_file_id >= $1 AND staging_file_id <= $2
            "#,
        )
        .bind(start_staging_file_id)
        .bind(end_staging_file_id)
        .fetch_one(&self.pool)
        .await?;
        let start: Option<i64> = row.try_get("start_id")?;
        let end: Option<i64> = row.try_get("end_id")?;
        Ok(start.zip(end))
    }

    async fn load_files_for_table(
        &self,
        table_name: &str,
        start_load_file_id: i64,
        end_load_file_id: i64,
    ) -> JournalResult<Vec<LoadFile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, staging_file_id, location, table_name, total_events
            FROM wh_load_files
            WHERE table_name = $1 AND id >= $2 AND id <= $3
            ORDER BY id ASC
            "#,
        )
        .bind(table_name)
        .bind(start_load_file_id)
        .bind(end_load_file_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(LoadFile {
                    id: row.try_get("id")?,
                    staging_file_id: row.try_get("staging_file_id")?,
                    location: row.try_get("location")?,
                    table_name: row.try_get("table_name")?,
                    total_events: row.try_get("total_events")?,
                })
            })
            .collect()
    }

    async fn interrupted_destinations(
        &self,
        destination_type: DestinationType,
    ) -> JournalResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT destination_id
            FROM wh_uploads
            WHERE destination_type = $1 AND (status = $2 OR status = $3)
            "#,
        )
        .bind(destination_type.as_str())
        .bind(UploadState::ExportingData.as_str())
        .bind(UploadState::ExportingDataFailed.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

/// Record `message` under `state`'s key in the error blob and bump the
/// attempt counter for that state.
pub(crate) fn merge_error(blob: &mut serde_json::Value, state: UploadState, message: &str) {
    if !blob.is_object() {
        *blob = json!({});
    }
    let entry = blob
        .as_object_mut()
        .map(|map| {
            map.entry(state.as_str().to_string())
                .or_insert_with(|| json!({"attempt": 0, "errors": []}))
        })
        .filter(|entry| entry.is_object());
    let Some(entry) = entry else { return };

    let attempt = entry.get("attempt").and_then(|a| a.as_i64()).unwrap_or(0);
    entry["attempt"] = json!(attempt + 1);
    match entry.get_mut("errors").and_then(|e| e.as_array_mut()) {
        Some(errors) => errors.push(json!(message)),
        None => entry["errors"] = json!([message]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_error_bumps_attempts() {
        let mut blob = json!({});
        merge_error(&mut blob, UploadState::ExportingDataFailed, "timeout");
        merge_error(&mut blob, UploadState::ExportingDataFailed, "refused");

        assert_eq!(blob["exporting_data_failed"]["attempt"], json!(2));
        assert_eq!(
            blob["exporting_data_failed"]["errors"],
            json!(["timeout", "refused"])
        );
    }

    #[test]
    fn test_merge_error_keys_by_state() {
        let mut blob = json!({});
        merge_error(&mut blob, UploadState::UpdatingSchemaFailed, "bad ddl");
        merge_error(&mut blob, UploadState::ExportingDataFailed, "timeout");

        assert_eq!(blob["updating_schema_failed"]["attempt"], json!(1));
        assert_eq!(blob["exporting_data_failed"]["attempt"], json!(1));
    }

    #[test]
    fn test_merge_error_recovers_from_malformed_blob() {
        let mut blob = json!("not-an-object");
        merge_error(&mut blob, UploadState::ExportingDataFailed, "timeout");
        assert_eq!(blob["exporting_data_failed"]["attempt"], json!(1));
    }
}
