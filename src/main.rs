use tenant_schema_gateway::api::{self, AppState};
use tenant_schema_gateway::config::Config;
use tenant_schema_gateway::pool::PoolManager;
use tenant_schema_gateway::provisioning::ProvisioningOrchestrator;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment from .env file if present, before anything reads it
    let dotenv = dotenvy::dotenv();

    let config = Config::from_env()?;

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!(
            "Warning: Could not create log directory {}: {}",
            config.log_dir.display(),
            e
        );
    }

    // Daily rotated JSON file next to human-readable console output
    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "tenant-schema-gateway.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tenant_schema_gateway=trace")),
        )
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_writer(non_blocking),
        )
        .init();

    debug!("Logging initialized - log directory: {}", config.log_dir.display());
    if let Err(e) = dotenv {
        warn!("No .env file found or error loading it: {}", e);
    }

    let socket_addr = config.socket_addr()?;

    info!("Starting tenant schema gateway on {} (mode: {})", socket_addr, config.mode);
    info!("API root: {}", if config.api_root.is_empty() { "/" } else { config.api_root.as_str() });
    info!(
        "Database: {}:{} (maintenance database: {})",
        config.database_host, config.database_port, config.maintenance_database
    );
    info!("Max connections per pool: {}", config.max_connections_per_pool);
    info!("Max total connections: {}", config.max_total_connections);
    info!("Pool idle timeout: {:?}", config.pool_idle_timeout);
    info!("Allowed networks: {:?}", config.allowed_networks);
    info!("Trusted proxies: {:?}", config.trusted_proxies);

    let pool_manager = Arc::new(PoolManager::new(config.clone()));
    let orchestrator = Arc::new(ProvisioningOrchestrator::new(pool_manager.clone()));

    let state = AppState::new(orchestrator, config.clone()).with_pool_manager(pool_manager.clone());
    let app = api::app(Arc::new(state)).layer(TraceLayer::new_for_http());

    // Spawn cleanup task for idle pools
    let cleanup_pool_manager = pool_manager.clone();
    let cleanup_every = config.pool_idle_timeout.max(std::time::Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = interval(cleanup_every);

        loop {
            interval.tick().await;
            let removed = cleanup_pool_manager.cleanup_idle_pools().await;
            if removed > 0 {
                info!("Cleanup task removed {} idle pools", removed);
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&socket_addr).await?;
    info!("Server listening on {}", socket_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
