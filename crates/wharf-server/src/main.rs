//! Wharf Server - Main entry point

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use wharf_common::logging::{init_logging, LogConfig};
use wharf_server::adapter::AdapterRegistry;
use wharf_server::config::Config;
use wharf_server::controlplane::{self, ConfigSubscriber};
use wharf_server::dispatcher::{Dispatcher, DispatcherConfig, OrchestratorState};
use wharf_server::http::{self, AppState};
use wharf_server::journal::{Journal, PgJournal};
use wharf_server::model::DestinationType;
use wharf_server::worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with configuration from environment
    let log_config = LogConfig::from_env()?
        .with_file_prefix("wharf-server")
        .with_filter_directives("wharf_server=debug,tower_http=debug,sqlx=info");
    init_logging(&log_config)?;

    info!("Starting wharf server");

    // Load configuration
    let config = Config::load()?;
    info!(
        mode = %config.warehouse.mode,
        "Configuration loaded - server will bind to {}:{}",
        config.server.host,
        config.server.web_port
    );

    // Initialize database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    // Run migrations
    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    let journal: Arc<dyn Journal> = Arc::new(PgJournal::new(db_pool));
    let orchestrator = Arc::new(OrchestratorState::new());

    // Concrete warehouse drivers are linked at composition time; without
    // them every destination resolves to the null adapter and fails its
    // connection checks.
    let adapters = AdapterRegistry::new();
    if adapters.is_empty() {
        warn!("No warehouse drivers registered; destinations will fail connection checks");
    }

    let mode = config.warehouse.mode;
    let mut dispatcher_handles = Vec::new();

    if mode.is_master() {
        // Materialize destinations from the control plane and spawn a
        // worker per (destination, namespace).
        let worker_config = WorkerConfig {
            no_of_workers: config.warehouse.no_of_workers,
            retry_sleep: config.warehouse.worker_retry_sleep,
            queue_depth: config.warehouse.worker_queue_depth,
        };
        let subscriber =
            ConfigSubscriber::new(journal.clone(), orchestrator.clone(), worker_config);
        match config.warehouse.control_plane_file.clone() {
            Some(path) => {
                info!(path = %path.display(), "subscribing to control-plane snapshot file");
                let rx = controlplane::file_source(path, config.warehouse.control_plane_poll);
                subscriber.spawn(rx);
            }
            None => warn!("WHARF_CONTROL_PLANE_FILE not set; no destinations will be active"),
        }

        // One dispatcher per destination type.
        for destination_type in DestinationType::ALL {
            let adapter = adapters.adapter_for(destination_type)?;
            let dispatcher = Dispatcher::new(
                destination_type,
                journal.clone(),
                adapter,
                DispatcherConfig::from(&config.warehouse),
                orchestrator.clone(),
            );
            dispatcher.prepare_crash_recovery().await?;
            dispatcher_handles.push(dispatcher.spawn());
        }
        info!(
            dispatchers = dispatcher_handles.len(),
            "warehouse master started"
        );
    }

    if mode.is_slave() {
        // Load-file producers live in a separate deployment; a slave-only
        // process has nothing to run here.
        info!("slave mode: load-file producers are external to this binary");
    }

    // Build the application router
    let state = AppState {
        journal,
        orchestrator,
        mode,
    };
    let app = http::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.web_port).parse()?;
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_timeout = config.server.shutdown_timeout_secs;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_timeout));

    // A dispatcher only returns on a fatal journal error; treat that as a
    // process failure so restart-driven recovery can take over.
    let dispatchers = async move {
        if dispatcher_handles.is_empty() {
            std::future::pending::<()>().await;
        }
        for handle in dispatcher_handles {
            handle.await??;
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = server => result?,
        result = dispatchers => result?,
    }

    info!("Server shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give in-flight requests time to complete
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
