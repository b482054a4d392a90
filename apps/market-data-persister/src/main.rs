//! Market Data Persister Binary
//!
//! Starts the consumer pool, the health server and, optionally, feeds a
//! replay file into the broker.
//!
//! The broker is the in-process [`InMemoryBroker`]; there is no network
//! transport. Messages arrive only through `PERSISTER_REPLAY_FILE`.
//! Without it the pool consumes an empty queue until a shutdown signal.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-persister
//! PERSISTER_REPLAY_FILE=dead-letters.jsonl cargo run --bin market-data-persister
//! ```
//!
//! # Environment Variables
//!
//! - `PERSISTER_DATABASE_PATH`: SQLite database file (default: market_data.db)
//! - `PERSISTER_CONCURRENT_CONSUMERS` / `PERSISTER_MAX_CONCURRENT_CONSUMERS`: Worker bounds (default: 2 / 4)
//! - `PERSISTER_PREFETCH_COUNT`: Unacknowledged credit per worker (default: 50)
//! - `PERSISTER_RETRY_MAX_ATTEMPTS`: Local storage attempts (default: 3)
//! - `PERSISTER_LEGACY_NACK`: Nack instead of dead-lettering (default: false)
//! - `PERSISTER_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `PERSISTER_REPLAY_FILE`: Line-delimited bodies to replay, `-` for stdin
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `RUST_LOG`: Log filter (default: market_data_persister=info)

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use market_data_persister::application::ports::MetricsSink;
use market_data_persister::infrastructure::broker::{BrokerTopology, InMemoryBroker};
use market_data_persister::infrastructure::health::{HealthServer, HealthServerState};
use market_data_persister::infrastructure::metrics::{
    FanoutMetricsSink, PrometheusMetricsSink, RecordingMetricsSink,
};
use market_data_persister::infrastructure::persistence::SqliteRepository;
use market_data_persister::infrastructure::{replay, telemetry};
use market_data_persister::{
    ConsumerPool, DeliveryController, PersisterConfig, QueueDepth, init_metrics,
};
use tokio::io::BufReader;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often replay mode checks whether the queue has drained.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting market data persister");

    let _metrics_handle = init_metrics()?;

    let config = PersisterConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let repository = Arc::new(SqliteRepository::open(&config.storage).await?);
    let broker = Arc::new(InMemoryBroker::new(BrokerTopology::from_settings(
        &config.broker,
    )));

    let recording = Arc::new(RecordingMetricsSink::new());
    let metrics: Arc<dyn MetricsSink> = Arc::new(
        FanoutMetricsSink::new()
            .with(Arc::new(PrometheusMetricsSink))
            .with(Arc::clone(&recording) as Arc<dyn MetricsSink>),
    );

    let controller = Arc::new(
        DeliveryController::new(repository, metrics)
            .with_retry_policy(config.retry.clone())
            .with_failure_mode(config.failure_mode()),
    );
    let pool = Arc::new(ConsumerPool::new(
        Arc::clone(&broker),
        controller,
        config.consumer.clone(),
    ));

    if config.server.health_port == 0 {
        tracing::info!("Health server disabled");
    } else {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            recording,
            Arc::clone(&broker) as Arc<dyn QueueDepth>,
            pool.activity(),
            config.consumer.max_consumers * usize::from(config.consumer.prefetch),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    let pool_task = {
        let pool = Arc::clone(&pool);
        let token = shutdown_token.clone();
        tokio::spawn(async move { pool.run(token).await })
    };

    tracing::info!("Market data persister ready");

    if let Some(path) = &config.replay_file {
        let summary = replay_input(path, &broker, &config.broker.exchange).await?;
        if summary.lines > 0 {
            tokio::select! {
                () = wait_until_idle(&broker) => {
                    tracing::info!(lines = summary.lines, "Replay input processed");
                }
                () = await_signal() => {}
            }
        }
    } else {
        tracing::info!("No replay input configured, in-process queue stays empty until shutdown");
        await_signal().await;
    }

    shutdown_token.cancel();
    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, pool_task).await {
        Ok(joined) => {
            let summary = joined??;
            tracing::info!(
                workers_started = summary.workers_started,
                deliveries = summary.deliveries_handled,
                "Consumers drained"
            );
        }
        Err(_) => tracing::warn!("Consumers did not drain before the shutdown timeout"),
    }
    broker.close();

    let stats = broker.stats();
    tracing::info!(
        delivered = stats.delivered,
        acked = stats.acked,
        requeued = stats.requeued,
        dead_letters = broker.dead_letters().len(),
        "Market data persister stopped"
    );
    Ok(())
}

/// Feed a replay file, or stdin for `-`, into the broker.
async fn replay_input(
    path: &Path,
    broker: &InMemoryBroker,
    exchange: &str,
) -> Result<replay::ReplaySummary, replay::ReplayError> {
    if path.as_os_str() == "-" {
        tracing::info!("Replaying from stdin");
        replay::replay(BufReader::new(tokio::io::stdin()), broker, exchange).await
    } else {
        tracing::info!(path = %path.display(), "Replaying from file");
        let file = tokio::fs::File::open(path).await?;
        replay::replay(BufReader::new(file), broker, exchange).await
    }
}

/// Resolve once nothing is queued or awaiting settlement.
async fn wait_until_idle(broker: &InMemoryBroker) {
    let mut poll = tokio::time::interval(IDLE_POLL_INTERVAL);
    loop {
        poll.tick().await;
        if broker.is_idle() {
            return;
        }
    }
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
fn log_config(config: &PersisterConfig) {
    tracing::info!(
        exchange = %config.broker.exchange,
        queue = %config.broker.queue,
        min_consumers = config.consumer.min_consumers,
        max_consumers = config.consumer.max_consumers,
        prefetch = config.consumer.prefetch,
        retry_attempts = config.retry.max_attempts,
        legacy_nack = config.failure.legacy_nack,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        routing_keys = ?config.broker.routing_keys.patterns(),
        dead_letter_exchange = %config.broker.dead_letter.exchange,
        dead_letter_queue = %config.broker.dead_letter.queue,
        database = %config.storage.database_path.display(),
        "Broker topology and storage"
    );
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_signal() {
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
}
