//! HTTP surface
//!
//! Two endpoints: `POST /v1/process` lets producers announce staging
//! files, and `GET /health` reports liveness. The ingest route is only
//! mounted in master-capable modes; a slave only serves health.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::config::WarehouseMode;
use crate::dispatcher::OrchestratorState;
use crate::error::{AppError, AppResult};
use crate::journal::Journal;
use crate::model::NewStagingFile;
use crate::schema::WarehouseSchema;

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub journal: Arc<dyn Journal>,
    pub orchestrator: Arc<OrchestratorState>,
    pub mode: WarehouseMode,
}

/// Build the application router for the given mode.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new().route("/health", get(health));
    if state.mode.is_master() {
        router = router.route("/v1/process", post(process_staging_file));
    }
    router
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Staging-file announcement payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    location: String,
    schema: WarehouseSchema,
    batch_destination: BatchDestination,
    #[serde(default)]
    total_events: i64,
    #[serde(default)]
    first_event_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct BatchDestination {
    source: IdRef,
    destination: IdRef,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

/// Journal one staging file in state `waiting`.
async fn process_staging_file(
    State(state): State<AppState>,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> AppResult<StatusCode> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    debug!(
        location = %request.location,
        source_id = %request.batch_destination.source.id,
        destination_id = %request.batch_destination.destination.id,
        "staging file announced"
    );

    state
        .journal
        .insert_staging_file(NewStagingFile {
            location: request.location,
            source_id: request.batch_destination.source.id,
            destination_id: request.batch_destination.destination.id,
            schema: request.schema,
            total_events: request.total_events,
            first_event_at: request.first_event_at,
            last_event_at: request.last_event_at,
        })
        .await?;

    Ok(StatusCode::OK)
}

/// Liveness document: server status, journal connectivity, mode, and the
/// number of currently active worker tasks.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db = if state.journal.healthy().await {
        "UP"
    } else {
        "DOWN"
    };
    Json(json!({
        "server": "UP",
        "db": db,
        "acceptingEvents": state.mode.is_master(),
        "warehouseMode": state.mode.as_str().to_uppercase(),
        "goroutines": state.orchestrator.active_workers(),
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::MemJournal;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(mode: WarehouseMode) -> (Router, Arc<MemJournal>) {
        let journal = Arc::new(MemJournal::new());
        let state = AppState {
            journal: journal.clone(),
            orchestrator: Arc::new(OrchestratorState::new()),
            mode,
        };
        (router(state), journal)
    }

    fn process_body() -> String {
        json!({
            "location": "s3://staging/batch-1.json.gz",
            "schema": {"pageviews": {"id": "string"}},
            "batchDestination": {
                "source": {"id": "src-1"},
                "destination": {"id": "dst-1"}
            },
            "totalEvents": 250,
            "firstEventAt": "2025-03-01T10:00:00Z",
            "lastEventAt": "2025-03-01T10:05:00Z"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_process_inserts_waiting_staging_file() {
        let (app, journal) = app(WarehouseMode::Master);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/process")
                    .header("content-type", "application/json")
                    .body(Body::from(process_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let files = journal
            .pending_staging_files("src-1", "dst-1")
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].location, "s3://staging/batch-1.json.gz");
        assert_eq!(files[0].total_events, 250);
        assert_eq!(
            files[0].status,
            crate::model::StagingFileStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_process_rejects_malformed_body() {
        let (app, _journal) = app(WarehouseMode::Master);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/process")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_process_not_mounted_in_slave_mode() {
        let (app, _journal) = app(WarehouseMode::Slave);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/process")
                    .header("content-type", "application/json")
                    .body(Body::from(process_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_document() {
        let (app, _journal) = app(WarehouseMode::MasterAndSlave);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["server"], "UP");
        assert_eq!(body["db"], "UP");
        assert_eq!(body["acceptingEvents"], true);
        assert_eq!(body["warehouseMode"], "MASTER_AND_SLAVE");
        assert_eq!(body["goroutines"], 0);
    }
}
