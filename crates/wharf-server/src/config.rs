//! Configuration management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wharf_analytics::CounterConfig;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default HTTP listen port.
pub const DEFAULT_WEB_PORT: u16 = 8082;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/wharf";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Orchestrator Configuration Constants
// ============================================================================

/// Default global cap on simultaneously active upload jobs.
pub const DEFAULT_NO_OF_WORKERS: usize = 8;

/// Default maximum staging files folded into one upload.
pub const DEFAULT_STAGING_FILES_BATCH_SIZE: usize = 240;

/// Default minimum spacing between new-upload creation per destination.
pub const DEFAULT_UPLOAD_FREQ_SECS: u64 = 1800;

/// Default dispatcher cycle period.
pub const DEFAULT_MAIN_LOOP_SLEEP_SECS: u64 = 60;

/// Default sleep while waiting on the active-worker cap.
pub const DEFAULT_WORKER_RETRY_SLEEP_SECS: u64 = 5;

/// Default number of attempts an upload gets before the abort window applies.
pub const DEFAULT_MIN_RETRY_ATTEMPTS: i64 = 3;

/// Default retry window in minutes.
pub const DEFAULT_RETRY_TIME_WINDOW_MINS: u64 = 180;

/// Default per-job table-load parallelism.
pub const DEFAULT_MAX_PARALLEL_LOADS: usize = 4;

/// Capacity of each per-destination worker queue.
pub const DEFAULT_WORKER_QUEUE_DEPTH: usize = 100;

/// Default poll interval for the control-plane snapshot source.
pub const DEFAULT_CONTROL_PLANE_POLL_SECS: u64 = 30;

/// Which halves of the pipeline this process runs.
///
/// Master-capable modes run the dispatcher and accept staging files over
/// HTTP; slave-capable modes run the load-file producers. `Embedded` runs
/// everything inside a larger host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseMode {
    Master,
    Slave,
    MasterAndSlave,
    #[default]
    Embedded,
}

impl WarehouseMode {
    /// Runs the dispatcher and the ingest endpoint.
    pub fn is_master(self) -> bool {
        matches!(
            self,
            WarehouseMode::Master | WarehouseMode::MasterAndSlave | WarehouseMode::Embedded
        )
    }

    /// Runs the load-file producers.
    pub fn is_slave(self) -> bool {
        matches!(
            self,
            WarehouseMode::Slave | WarehouseMode::MasterAndSlave | WarehouseMode::Embedded
        )
    }

    /// Owns its own HTTP surface (everything except embedded).
    pub fn is_standalone(self) -> bool {
        self != WarehouseMode::Embedded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WarehouseMode::Master => "master",
            WarehouseMode::Slave => "slave",
            WarehouseMode::MasterAndSlave => "master_and_slave",
            WarehouseMode::Embedded => "embedded",
        }
    }
}

impl std::str::FromStr for WarehouseMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(WarehouseMode::Master),
            "slave" => Ok(WarehouseMode::Slave),
            "master_and_slave" => Ok(WarehouseMode::MasterAndSlave),
            "embedded" => Ok(WarehouseMode::Embedded),
            _ => Err(anyhow::anyhow!("Invalid warehouse mode: {}", s)),
        }
    }
}

impl std::fmt::Display for WarehouseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub warehouse: WarehouseConfig,
    pub counters: CounterConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub web_port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub mode: WarehouseMode,
    pub no_of_workers: usize,
    pub staging_files_batch_size: usize,
    pub upload_freq: Duration,
    pub main_loop_sleep: Duration,
    pub worker_retry_sleep: Duration,
    pub min_retry_attempts: i64,
    pub retry_time_window: Duration,
    /// Bypass the upload-frequency gate entirely.
    pub sync_freq_ignore: bool,
    pub max_parallel_loads: usize,
    pub worker_queue_depth: usize,
    /// JSON file carrying the control-plane snapshot, polled for changes.
    pub control_plane_file: Option<PathBuf>,
    pub control_plane_poll: Duration,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: env_or("WHARF_HOST", DEFAULT_SERVER_HOST.to_string()),
                web_port: env_parsed("WHARF_WEB_PORT", DEFAULT_WEB_PORT),
                shutdown_timeout_secs: env_parsed(
                    "WHARF_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_parsed(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_parsed(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_parsed(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            warehouse: WarehouseConfig {
                mode: std::env::var("WHARF_MODE")
                    .ok()
                    .map(|s| s.parse())
                    .transpose()?
                    .unwrap_or_default(),
                no_of_workers: env_parsed("WHARF_NO_OF_WORKERS", DEFAULT_NO_OF_WORKERS),
                staging_files_batch_size: env_parsed(
                    "WHARF_STAGING_FILES_BATCH_SIZE",
                    DEFAULT_STAGING_FILES_BATCH_SIZE,
                ),
                upload_freq: Duration::from_secs(env_parsed(
                    "WHARF_UPLOAD_FREQ_IN_S",
                    DEFAULT_UPLOAD_FREQ_SECS,
                )),
                main_loop_sleep: Duration::from_secs(env_parsed(
                    "WHARF_MAIN_LOOP_SLEEP_IN_S",
                    DEFAULT_MAIN_LOOP_SLEEP_SECS,
                )),
                worker_retry_sleep: Duration::from_secs(env_parsed(
                    "WHARF_WORKER_RETRY_SLEEP_IN_S",
                    DEFAULT_WORKER_RETRY_SLEEP_SECS,
                )),
                min_retry_attempts: env_parsed(
                    "WHARF_MIN_RETRY_ATTEMPTS",
                    DEFAULT_MIN_RETRY_ATTEMPTS,
                ),
                retry_time_window: Duration::from_secs(
                    env_parsed(
                        "WHARF_RETRY_TIME_WINDOW_IN_MINS",
                        DEFAULT_RETRY_TIME_WINDOW_MINS,
                    ) * 60,
                ),
                sync_freq_ignore: env_parsed("WHARF_SYNC_FREQ_IGNORE", false),
                max_parallel_loads: env_parsed(
                    "WHARF_MAX_PARALLEL_LOADS",
                    DEFAULT_MAX_PARALLEL_LOADS,
                ),
                worker_queue_depth: DEFAULT_WORKER_QUEUE_DEPTH,
                control_plane_file: std::env::var("WHARF_CONTROL_PLANE_FILE")
                    .ok()
                    .map(PathBuf::from),
                control_plane_poll: Duration::from_secs(env_parsed(
                    "WHARF_CONTROL_PLANE_POLL_IN_S",
                    DEFAULT_CONTROL_PLANE_POLL_SECS,
                )),
            },
            counters: CounterConfig::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.web_port == 0 {
            anyhow::bail!("Web port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.warehouse.no_of_workers == 0 {
            anyhow::bail!("no_of_workers must be greater than 0");
        }

        if self.warehouse.staging_files_batch_size == 0 {
            anyhow::bail!("staging_files_batch_size must be greater than 0");
        }

        if self.warehouse.max_parallel_loads == 0 {
            anyhow::bail!("max_parallel_loads must be greater than 0");
        }

        // Counter parameters are validated at counter construction, but a
        // misconfigured tolerance should fail startup, not the first build.
        self.counters
            .build("config-check")
            .map_err(|e| anyhow::anyhow!("counter configuration invalid: {e}"))?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                web_port: DEFAULT_WEB_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            warehouse: WarehouseConfig::default(),
            counters: CounterConfig::default(),
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            mode: WarehouseMode::Embedded,
            no_of_workers: DEFAULT_NO_OF_WORKERS,
            staging_files_batch_size: DEFAULT_STAGING_FILES_BATCH_SIZE,
            upload_freq: Duration::from_secs(DEFAULT_UPLOAD_FREQ_SECS),
            main_loop_sleep: Duration::from_secs(DEFAULT_MAIN_LOOP_SLEEP_SECS),
            worker_retry_sleep: Duration::from_secs(DEFAULT_WORKER_RETRY_SLEEP_SECS),
            min_retry_attempts: DEFAULT_MIN_RETRY_ATTEMPTS,
            retry_time_window: Duration::from_secs(DEFAULT_RETRY_TIME_WINDOW_MINS * 60),
            sync_freq_ignore: false,
            max_parallel_loads: DEFAULT_MAX_PARALLEL_LOADS,
            worker_queue_depth: DEFAULT_WORKER_QUEUE_DEPTH,
            control_plane_file: None,
            control_plane_poll: Duration::from_secs(DEFAULT_CONTROL_PLANE_POLL_SECS),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("master".parse::<WarehouseMode>().unwrap(), WarehouseMode::Master);
        assert_eq!(
            "MASTER_AND_SLAVE".parse::<WarehouseMode>().unwrap(),
            WarehouseMode::MasterAndSlave
        );
        assert!("sidecar".parse::<WarehouseMode>().is_err());
    }

    #[test]
    fn test_mode_predicates() {
        assert!(WarehouseMode::Master.is_master());
        assert!(!WarehouseMode::Master.is_slave());
        assert!(WarehouseMode::Slave.is_slave());
        assert!(!WarehouseMode::Slave.is_master());
        assert!(WarehouseMode::MasterAndSlave.is_master());
        assert!(WarehouseMode::MasterAndSlave.is_slave());
        assert!(WarehouseMode::Embedded.is_master());
        assert!(WarehouseMode::Embedded.is_slave());
        assert!(!WarehouseMode::Embedded.is_standalone());
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.warehouse.no_of_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        config.database.max_connections = 10;
        assert!(config.validate().is_err());
    }
}
