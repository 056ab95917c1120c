use problem_service::config::{LogFormat, ObjectBackend, RecordBackend};
use problem_service::{
    start_api_server, AppState, Config, MemoryObjectStore, MemoryProblemStore, ObjectStore,
    PgProblemStore, ProblemService, ProblemStore, S3ObjectStore, StartupError,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet
            eprintln!("problem-service: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.service.log_level, config.service.log_format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Problem service failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    info!(
        service = %config.service.name,
        records = ?config.database.backend,
        objects = ?config.s3.backend,
        "Starting problem service"
    );

    init_metrics(config.service.metrics_port)?;

    // Kept apart from the trait object so the pool can be closed on shutdown
    let mut pg_store = None;

    let records: Arc<dyn ProblemStore> = match config.database.backend {
        RecordBackend::Postgres => {
            let store = Arc::new(
                PgProblemStore::new(&config.database)
                    .await
                    .map_err(StartupError::RecordStore)?,
            );

            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .map_err(StartupError::RecordStore)?;
            }

            pg_store = Some(store.clone());
            store
        }
        RecordBackend::Memory => {
            warn!("Using in-memory record store, problems are lost on restart");
            Arc::new(MemoryProblemStore::new())
        }
    };

    let objects: Arc<dyn ObjectStore> = match config.s3.backend {
        ObjectBackend::S3 => Arc::new(
            S3ObjectStore::new(&config.s3)
                .await
                .map_err(StartupError::ObjectStore)?,
        ),
        ObjectBackend::Memory => {
            warn!("Using in-memory object store, files are lost on restart");
            Arc::new(MemoryObjectStore::new())
        }
    };

    let state = AppState {
        service: Arc::new(ProblemService::new(records, objects, config.s3.bucket.clone())),
        service_name: config.service.name.clone(),
    };

    let result = start_api_server(state, &config.api, shutdown_signal()).await;

    if let Some(store) = pg_store {
        store.close().await;
    }

    info!("Problem service stopped");
    result
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<(), StartupError> {
    if port == 0 {
        info!("Prometheus metrics exporter disabled");
        return Ok(());
    }

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .map_err(|e| StartupError::Metrics(e.to_string()))?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
