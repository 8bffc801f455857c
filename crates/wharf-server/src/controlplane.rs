//! Control-plane subscription
//!
//! The set of active sources and destinations comes from an opaque,
//! externally fed event source. The subscriber materializes each snapshot
//! into per-type warehouse lists, resolves namespaces, and spawns a worker
//! for every new `(destination, namespace)` pair. Destinations that drop
//! out of a snapshot simply disappear from the active lists; their workers
//! stay parked on their queues.
//!
//! A polled JSON file ships as the default snapshot transport for
//! standalone deployments.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wharf_common::WharfError;

use crate::dispatcher::OrchestratorState;
use crate::journal::Journal;
use crate::model::{DestinationType, Warehouse};
use crate::worker::{spawn_worker, WorkerConfig};

/// Everything the control plane knows about the active pipelines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneSnapshot {
    pub sources: Vec<SourceConfig>,
}

/// One event source and the destinations it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

/// One warehouse destination as configured upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub destination_type: DestinationType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub sync_frequency_secs: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

/// Collapse a raw name into something every warehouse accepts as a
/// schema/dataset name: lowercase alphanumerics and underscores, never
/// starting with a digit.
pub fn to_safe_namespace(raw: &str) -> String {
    let mut namespace = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            namespace.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore && !namespace.is_empty() {
            namespace.push('_');
            last_was_underscore = true;
        }
    }
    let namespace = namespace.trim_end_matches('_').to_string();
    if namespace.is_empty() {
        return "default".to_string();
    }
    if namespace.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("_{namespace}");
    }
    namespace
}

/// Materializes control-plane snapshots into orchestrator state.
pub struct ConfigSubscriber {
    journal: Arc<dyn Journal>,
    state: Arc<OrchestratorState>,
    worker_config: WorkerConfig,
}

impl ConfigSubscriber {
    pub fn new(
        journal: Arc<dyn Journal>,
        state: Arc<OrchestratorState>,
        worker_config: WorkerConfig,
    ) -> Self {
        Self {
            journal,
            state,
            worker_config,
        }
    }

    /// Apply the current snapshot, then every subsequent change.
    pub fn spawn(self, mut rx: watch::Receiver<ControlPlaneSnapshot>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                self.apply(&snapshot).await;
                if rx.changed().await.is_err() {
                    info!("control-plane source closed, subscriber stopping");
                    return;
                }
            }
        })
    }

    /// Rebuild the active warehouse lists and spawn workers for pairs seen
    /// for the first time.
    pub async fn apply(&self, snapshot: &ControlPlaneSnapshot) {
        let mut by_type: HashMap<DestinationType, Vec<Warehouse>> = HashMap::new();

        for source in &snapshot.sources {
            for destination in &source.destinations {
                let namespace = self.resolve_namespace(source, destination).await;
                let warehouse = Warehouse {
                    source_id: source.id.clone(),
                    source_name: source.name.clone(),
                    destination_id: destination.id.clone(),
                    destination_type: destination.destination_type,
                    namespace,
                    enabled: destination.enabled,
                    sync_frequency_secs: destination.sync_frequency_secs,
                };

                let worker_id = warehouse.worker_id();
                if !self.state.has_worker(&worker_id) {
                    debug!(worker = %worker_id, "spawning worker for new destination");
                    let sender = spawn_worker(
                        worker_id.clone(),
                        self.state.clone(),
                        self.worker_config.clone(),
                    );
                    self.state.register_worker(&worker_id, sender);
                }

                by_type
                    .entry(destination.destination_type)
                    .or_default()
                    .push(warehouse);
            }
        }

        for destination_type in DestinationType::ALL {
            let warehouses = by_type.remove(&destination_type).unwrap_or_default();
            if !warehouses.is_empty() {
                info!(
                    destination_type = %destination_type,
                    warehouses = warehouses.len(),
                    "materialized destination set"
                );
            }
            self.state.set_warehouses(destination_type, warehouses);
        }
    }

    /// Namespace precedence: explicit destination config, then whatever the
    /// journal already uses for the pair, then the sanitized source name.
    async fn resolve_namespace(
        &self,
        source: &SourceConfig,
        destination: &DestinationConfig,
    ) -> String {
        if let Some(namespace) = &destination.namespace {
            if !namespace.trim().is_empty() {
                return to_safe_namespace(namespace);
            }
        }
        match self.journal.namespace_for(&source.id, &destination.id).await {
            Ok(Some(namespace)) => namespace,
            Ok(None) => to_safe_namespace(&source.name),
            Err(e) => {
                warn!(
                    source_id = %source.id,
                    destination_id = %destination.id,
                    error = %e,
                    "namespace lookup failed, deriving from source name"
                );
                to_safe_namespace(&source.name)
            }
        }
    }
}

/// Read and parse one snapshot from disk.
async fn load_snapshot(path: &std::path::Path) -> Result<ControlPlaneSnapshot, WharfError> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

/// Poll a JSON snapshot file, emitting a new value whenever its parsed
/// contents change. The file may be absent at startup; an empty snapshot
/// is served until it appears.
pub fn file_source(
    path: PathBuf,
    poll_interval: Duration,
) -> watch::Receiver<ControlPlaneSnapshot> {
    let (tx, rx) = watch::channel(ControlPlaneSnapshot::default());
    tokio::spawn(async move {
        let mut last = ControlPlaneSnapshot::default();
        loop {
            match load_snapshot(&path).await {
                Ok(snapshot) => {
                    if snapshot != last {
                        info!(path = %path.display(), "control-plane snapshot changed");
                        last = snapshot.clone();
                        if tx.send(snapshot).is_err() {
                            return;
                        }
                    }
                }
                // A garbled file deserves a louder complaint than one that
                // simply isn't there yet.
                Err(e @ WharfError::Serialization(_)) => {
                    warn!(path = %path.display(), error = %e, "malformed control-plane snapshot")
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "control-plane snapshot unreadable")
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    });
    rx
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::MemJournal;

    fn snapshot(namespace: Option<&str>) -> ControlPlaneSnapshot {
        ControlPlaneSnapshot {
            sources: vec![SourceConfig {
                id: "src-1".to_string(),
                name: "My App 2".to_string(),
                destinations: vec![DestinationConfig {
                    id: "dst-1".to_string(),
                    destination_type: DestinationType::Snowflake,
                    enabled: true,
                    namespace: namespace.map(String::from),
                    sync_frequency_secs: Some(900),
                }],
            }],
        }
    }

    fn subscriber(journal: Arc<MemJournal>) -> (ConfigSubscriber, Arc<OrchestratorState>) {
        let state = Arc::new(OrchestratorState::new());
        let worker_config = WorkerConfig {
            no_of_workers: 4,
            retry_sleep: Duration::from_millis(5),
            queue_depth: 10,
        };
        (
            ConfigSubscriber::new(journal, state.clone(), worker_config),
            state,
        )
    }

    #[test]
    fn test_to_safe_namespace() {
        assert_eq!(to_safe_namespace("My App 2"), "my_app_2");
        assert_eq!(to_safe_namespace("  analytics  "), "analytics");
        assert_eq!(to_safe_namespace("9lives"), "_9lives");
        assert_eq!(to_safe_namespace("!!!"), "default");
        assert_eq!(to_safe_namespace("a--b__c"), "a_b_c");
    }

    #[tokio::test]
    async fn test_apply_materializes_warehouses_and_workers() {
        let (subscriber, state) = subscriber(Arc::new(MemJournal::new()));
        subscriber.apply(&snapshot(Some("prod"))).await;

        let warehouses = state.warehouses_for(DestinationType::Snowflake);
        assert_eq!(warehouses.len(), 1);
        assert_eq!(warehouses[0].namespace, "prod");
        assert_eq!(warehouses[0].sync_frequency_secs, Some(900));
        assert!(state.has_worker("dst-1_prod"));

        // Other destination types carry no warehouses.
        assert!(state.warehouses_for(DestinationType::BigQuery).is_empty());
    }

    #[tokio::test]
    async fn test_namespace_falls_back_to_journal_then_source_name() {
        let journal = Arc::new(MemJournal::new());
        let (subscriber, state) = subscriber(journal.clone());

        // No explicit namespace, nothing journaled: source name wins.
        subscriber.apply(&snapshot(None)).await;
        assert_eq!(
            state.warehouses_for(DestinationType::Snowflake)[0].namespace,
            "my_app_2"
        );

        // A journaled schema row pins the namespace.
        journal
            .update_schema_snapshot("src-1", "dst-1", "legacy_ns", &Default::default())
            .await
            .unwrap();
        subscriber.apply(&snapshot(None)).await;
        assert_eq!(
            state.warehouses_for(DestinationType::Snowflake)[0].namespace,
            "legacy_ns"
        );
    }

    #[tokio::test]
    async fn test_removed_destination_leaves_active_set() {
        let (subscriber, state) = subscriber(Arc::new(MemJournal::new()));
        subscriber.apply(&snapshot(Some("prod"))).await;
        assert_eq!(state.warehouses_for(DestinationType::Snowflake).len(), 1);

        subscriber.apply(&ControlPlaneSnapshot::default()).await;
        assert!(state.warehouses_for(DestinationType::Snowflake).is_empty());
        // The worker survives for when the destination returns.
        assert!(state.has_worker("dst-1_prod"));
    }

    #[tokio::test]
    async fn test_load_snapshot_classifies_failures() {
        let missing = std::env::temp_dir().join("wharf-cp-missing.json");
        assert!(matches!(
            load_snapshot(&missing).await,
            Err(WharfError::Io(_))
        ));

        let garbled = std::env::temp_dir().join(format!("wharf-cp-{}.json", std::process::id()));
        std::fs::write(&garbled, "{not json").unwrap();
        assert!(matches!(
            load_snapshot(&garbled).await,
            Err(WharfError::Serialization(_))
        ));
        std::fs::remove_file(&garbled).ok();
    }

    #[tokio::test]
    async fn test_snapshot_deserializes_from_wire_format() {
        let raw = r#"{
            "sources": [{
                "id": "src-1",
                "name": "Web",
                "destinations": [
                    {"id": "dst-1", "type": "BQ", "namespace": "events"},
                    {"id": "dst-2", "type": "RS", "enabled": false}
                ]
            }]
        }"#;
        let snapshot: ControlPlaneSnapshot = serde_json::from_str(raw).unwrap();
        let destinations = &snapshot.sources[0].destinations;
        assert_eq!(destinations[0].destination_type, DestinationType::BigQuery);
        assert!(destinations[0].enabled);
        assert_eq!(destinations[0].namespace.as_deref(), Some("events"));
        assert!(!destinations[1].enabled);
    }
}
