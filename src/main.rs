use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use action_flags::api::flag_routes;
use action_flags::bus::EventBus;
use action_flags::config::AppConfig;
use action_flags::coordinator::FlagCoordinator;
use action_flags::store::{FlagStore, LibSqlBackend};
use action_flags::worker::{EchoWorker, WorkerRunner};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;
    let port = config.server.port;

    eprintln!("🚩 Action Flags v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   REST API: http://0.0.0.0:{}/api/flags", port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws/events", port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn FlagStore> = Arc::new(
        LibSqlBackend::new_local(&config.server.db_path)
            .await
            .map_err(|e| {
                format!(
                    "Failed to open database at {}: {e}",
                    config.server.db_path.display()
                )
            })?,
    );
    eprintln!("   Database: {}", config.server.db_path.display());

    // ── Coordinator ──────────────────────────────────────────────────────
    let bus = EventBus::new(config.coordinator.event_buffer);
    let coordinator = Arc::new(FlagCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.coordinator.clone(),
    ));

    let shutdown = CancellationToken::new();
    let maintenance =
        coordinator.spawn_maintenance(config.maintenance.clone(), shutdown.child_token());
    eprintln!(
        "   Expiry sweep: every {}s, retention: {}",
        config.maintenance.sweep_interval.as_secs(),
        config
            .maintenance
            .retention
            .map(|r| format!("{}d", r.as_secs() / 86_400))
            .unwrap_or_else(|| "forever".to_string()),
    );

    // ── Workers ──────────────────────────────────────────────────────────
    let echo = if config.worker.echo_test_flags {
        let runner = WorkerRunner::new(
            Arc::new(EchoWorker::default()),
            Arc::clone(&coordinator),
            config.worker.clone(),
        );
        let handle = Arc::clone(&runner).start();
        eprintln!("   Echo worker: enabled for `test` flags");
        Some((runner, handle))
    } else {
        None
    };

    // ── HTTP ─────────────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = flag_routes(Arc::clone(&coordinator)).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "Flag coordinator listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl-C received, shutting down");
                }
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    shutdown.cancel();
    if let Some((runner, handle)) = echo {
        runner.shutdown();
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Echo worker task ended abnormally");
        }
    }
    if let Err(e) = maintenance.await {
        tracing::warn!(error = %e, "Maintenance task ended abnormally");
    }
    bus.shutdown().await;

    eprintln!("Goodbye!");
    Ok(())
}
