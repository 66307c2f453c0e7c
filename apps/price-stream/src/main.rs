//! Price Stream Binary
//!
//! Runs the streaming core with the sources configured in the environment
//! and serves health and metrics over HTTP.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin price-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Sources (at least one)
//! - `PRICE_STREAM_PRIMARY_URL`: Primary WebSocket feed
//! - `PRICE_STREAM_SECONDARY_URL`: Secondary WebSocket feed
//! - `PRICE_STREAM_POLLING_URL`: HTTP polling feed
//!
//! ## Optional
//! - `PRICE_STREAM_SYMBOLS`: Comma-separated symbols to keep warm
//! - `PRICE_STREAM_THROTTLE_MS`: Throttle window (default: 100)
//! - `PRICE_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use price_stream::infrastructure::health::{HealthServer, HealthServerState};
use price_stream::infrastructure::telemetry;
use price_stream::{
    PriceStreamService, SourceConnector, StreamConfig, connector_for, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Consumer id used for the warm symbols requested in the environment.
const WARM_CONSUMER: u64 = 0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting price stream");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable");
    }

    let config = StreamConfig::from_env()?;
    log_config(&config);

    let connectors = config
        .sources
        .iter()
        .map(connector_for)
        .collect::<Result<Vec<Arc<dyn SourceConnector>>, _>>()?;

    let health_port = config.server.health_port;
    let service = Arc::new(PriceStreamService::new(config, connectors)?);
    service.start()?;

    let shutdown_token = CancellationToken::new();

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&service),
    ));
    let health_server = HealthServer::new(health_port, health_state, shutdown_token.clone());
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    spawn_warm_consumer(&service, shutdown_token.clone());
    spawn_failover_logger(&service, shutdown_token.clone());

    tracing::info!("Price stream ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, service.stop()).await.is_err() {
        tracing::warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Shutdown timed out");
    }
    if let Err(e) = health_task.await {
        tracing::warn!(error = %e, "Health server task failed");
    }

    tracing::info!("Price stream stopped");
    Ok(())
}

/// Keep the symbols listed in `PRICE_STREAM_SYMBOLS` subscribed and log their ticks.
fn spawn_warm_consumer(service: &PriceStreamService, shutdown: CancellationToken) {
    let symbols: Vec<String> = std::env::var("PRICE_STREAM_SYMBOLS")
        .map(|raw| raw.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    if symbols.is_empty() {
        return;
    }

    let mut stream = service.subscribe(WARM_CONSUMER, &symbols);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                tick = stream.next() => match tick {
                    Some(tick) => tracing::debug!(
                        symbol = tick.symbol(),
                        price = %tick.price(),
                        source = %tick.source_id(),
                        "Tick"
                    ),
                    None => break,
                },
            }
        }
    });
}

/// Log every failover at info level for operators.
fn spawn_failover_logger(service: &PriceStreamService, shutdown: CancellationToken) {
    let mut events = service.failover_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => tracing::info!(
                        symbol = %event.symbol,
                        from = ?event.from_source,
                        to = ?event.to_source,
                        "Active source changed"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Failover log lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        sources = config.sources.len(),
        throttle_ms = u64::try_from(config.throttle_interval.as_millis()).unwrap_or(u64::MAX),
        stale_heartbeats = config.stale_heartbeats,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    for source in &config.sources {
        let descriptor = &source.descriptor;
        tracing::info!(
            source = %descriptor.id,
            priority = descriptor.priority,
            transport = descriptor.transport.as_str(),
            endpoint = %descriptor.endpoint,
            authenticated = source.credentials.is_some(),
            "Source configured"
        );
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
