//! FleetSim Engine
//!
//! A virtual device fleet simulator. Projects group simulated devices; each
//! enabled device emits synthesized JSON payloads to its target system
//! (HTTP, MQTT, Kafka, WebSocket, FTP/SFTP, cloud pub/sub) at its own
//! cadence until the project is stopped.
//!
//! # Graceful Shutdown
//!
//! The engine handles SIGTERM and SIGINT, ensuring:
//! - Every running simulation is stopped and drained
//! - Connector sessions are released best-effort
//! - The API server finishes in-flight requests

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetsim::api::{self, AppState};
use fleetsim::config::Config;
use fleetsim::engine::SimulationEngine;
use fleetsim::error::Result;
use fleetsim::metrics::MetricsCollector;
use fleetsim::store::{DescriptorStore, InMemoryStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🛰️  FleetSim Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Components:");
    info!("    • Device fleet simulation runtime");
    info!("    • Target connectors (http, mqtt, kafka, websocket, ftp, pubsub)");
    info!("    • Metrics collector + live log streaming");
    info!("═══════════════════════════════════════════════════════════════");

    // Load configuration
    let config = Config::from_env()?;
    info!("✅ Configuration loaded and validated");

    // Load the descriptor snapshot the runtime reads from
    let store: Arc<dyn DescriptorStore> = match &config.engine.snapshot_path {
        Some(path) => Arc::new(InMemoryStore::from_json_file(path).await?),
        None => {
            warn!("FLEET_SNAPSHOT_PATH not set, starting with an empty descriptor store");
            Arc::new(InMemoryStore::new())
        }
    };
    info!("✅ Descriptor store ready");

    // Build the shared metrics collector and the engine
    let metrics = Arc::new(MetricsCollector::new(config.metrics.response_window));
    let engine = Arc::new(SimulationEngine::new(
        store,
        metrics,
        config.simulator.clone(),
        config.log_stream.clone(),
    ));
    info!("✅ Simulation engine initialized");

    let state = Arc::new(AppState {
        engine: engine.clone(),
    });

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started successfully");
    info!("  📡 API: http://{}:{}", config.api.host, config.api.port);
    info!(
        "  🔗 Health: http://{}:{}/health",
        config.api.host, config.api.port
    );
    info!("═══════════════════════════════════════════════════════════════");

    // Serve until a shutdown signal arrives
    api::serve(state, &config.api.host, config.api.port, shutdown_signal()).await?;

    // Graceful shutdown: stop every running simulation within a bounded time
    info!("🛑 Initiating graceful shutdown...");
    let shutdown_timeout = Duration::from_secs(30);
    match tokio::time::timeout(shutdown_timeout, engine.emergency_stop_all()).await {
        Ok(stopped) => {
            if !stopped.is_empty() {
                info!("Stopped {} running projects", stopped.len());
            }
        }
        Err(_) => warn!("⚠️ Shutdown timeout exceeded, forcing exit"),
    }

    info!("👋 FleetSim Engine stopped gracefully");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("fleetsim=debug,tower_http=debug,rdkafka=warn,rumqttc=warn,info")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("📴 Shutdown signal received");
}
