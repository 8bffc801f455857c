//! Warehouse adapter contract
//!
//! Destination drivers implement [`WarehouseAdapter`]; the engine drives
//! them uniformly. DDL must be idempotent: drivers surface duplicate
//! tables/columns as [`AdapterError::AlreadyExists`], which callers treat
//! as success. Every call is expected to enforce its own deadline and
//! report a breach as [`AdapterError::DeadlineExceeded`].
//!
//! Concrete cloud drivers live out of tree and are registered with the
//! [`AdapterRegistry`] at process composition time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{DestinationType, LoadFile, Warehouse};
use crate::schema::{ColumnType, TableSchema, WarehouseSchema};

/// Adapter error types
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// Duplicate DDL; callers treat this as success.
    #[error("{object} already exists")]
    AlreadyExists { object: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("deadline exceeded while {0}")]
    DeadlineExceeded(String),
}

impl AdapterError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, AdapterError::AlreadyExists { .. })
    }
}

/// Uniform contract over destination warehouse drivers.
#[async_trait]
pub trait WarehouseAdapter: Send + Sync {
    fn destination_type(&self) -> DestinationType;

    /// Cap on concurrent table loads within one upload job.
    fn max_parallel_loads(&self) -> usize;

    /// Probe destination credentials and reachability.
    async fn test_connection(&self, warehouse: &Warehouse) -> Result<(), AdapterError>;

    /// Clean transient artifacts (temp tables, staged files) left behind by
    /// an interrupted run.
    async fn crash_recover(&self, warehouse: &Warehouse) -> Result<(), AdapterError>;

    /// Schema as the destination currently has it.
    async fn fetch_schema(&self, warehouse: &Warehouse) -> Result<WarehouseSchema, AdapterError>;

    async fn create_table(
        &self,
        warehouse: &Warehouse,
        table: &str,
        columns: &TableSchema,
    ) -> Result<(), AdapterError>;

    async fn add_column(
        &self,
        warehouse: &Warehouse,
        table: &str,
        column: &str,
        column_type: ColumnType,
    ) -> Result<(), AdapterError>;

    /// Load one table from its load files.
    async fn load_table(
        &self,
        warehouse: &Warehouse,
        table: &str,
        load_files: &[LoadFile],
        force_load: bool,
    ) -> Result<(), AdapterError>;

    /// Load the users table with a merge query referencing the already
    /// loaded identifies table.
    async fn load_users_table(
        &self,
        warehouse: &Warehouse,
        load_files: &[LoadFile],
    ) -> Result<(), AdapterError>;
}

/// Stand-in driver for destination types with no linked driver.
///
/// Every operation fails, `test_connection` included, so a destination
/// configured against a bare build surfaces as connection errors in the
/// journal instead of silently succeeding.
pub struct NullAdapter {
    destination_type: DestinationType,
}

impl NullAdapter {
    pub fn new(destination_type: DestinationType) -> Self {
        Self { destination_type }
    }

    fn no_driver(&self) -> AdapterError {
        AdapterError::Connection(format!(
            "no {} driver linked into this build",
            self.destination_type
        ))
    }
}

#[async_trait]
impl WarehouseAdapter for NullAdapter {
    fn destination_type(&self) -> DestinationType {
        self.destination_type
    }

    fn max_parallel_loads(&self) -> usize {
        1
    }

    async fn test_connection(&self, _warehouse: &Warehouse) -> Result<(), AdapterError> {
        Err(self.no_driver())
    }

    async fn crash_recover(&self, _warehouse: &Warehouse) -> Result<(), AdapterError> {
        Err(self.no_driver())
    }

    async fn fetch_schema(&self, _warehouse: &Warehouse) -> Result<WarehouseSchema, AdapterError> {
        Err(self.no_driver())
    }

    async fn create_table(
        &self,
        _warehouse: &Warehouse,
        _table: &str,
        _columns: &TableSchema,
    ) -> Result<(), AdapterError> {
        Err(self.no_driver())
    }

    async fn add_column(
        &self,
        _warehouse: &Warehouse,
        _table: &str,
        _column: &str,
        _column_type: ColumnType,
    ) -> Result<(), AdapterError> {
        Err(self.no_driver())
    }

    async fn load_table(
        &self,
        _warehouse: &Warehouse,
        _table: &str,
        _load_files: &[LoadFile],
        _force_load: bool,
    ) -> Result<(), AdapterError> {
        Err(self.no_driver())
    }

    async fn load_users_table(
        &self,
        _warehouse: &Warehouse,
        _load_files: &[LoadFile],
    ) -> Result<(), AdapterError> {
        Err(self.no_driver())
    }
}

/// Drivers available to this process, by destination type.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<DestinationType, Arc<dyn WarehouseAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn WarehouseAdapter>) {
        self.adapters.insert(adapter.destination_type(), adapter);
    }

    /// Resolve the driver for a destination type. Types without a
    /// registered driver get a [`NullAdapter`], so the engine always has
    /// something to drive and misconfiguration shows up as failed
    /// connection checks rather than missing machinery.
    pub fn adapter_for(
        &self,
        destination_type: DestinationType,
    ) -> Result<Arc<dyn WarehouseAdapter>, AdapterError> {
        Ok(self
            .adapters
            .get(&destination_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(NullAdapter::new(destination_type))))
    }

    /// Destination types with a real driver registered.
    pub fn registered_types(&self) -> Vec<DestinationType> {
        let mut types: Vec<_> = self.adapters.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Whether no real driver has been registered at all.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
