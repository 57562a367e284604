//! Correlay Server
//!
//! Publishes tracked requests, pulls responses off durable subscriptions,
//! correlates them back to their pending requests, recovers listeners after
//! restarts, and times out unanswered requests.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CORRELAY_CONFIG` | - | Explicit config file path |
//! | `CORRELAY_BROKER_MODE` | `embedded` | Broker backend: `embedded` or `nats` |
//! | `CORRELAY_NATS_URL` | `nats://localhost:4222` | NATS server URL |
//! | `CORRELAY_STREAM_NAME` | `CORRELAY` | JetStream stream name |
//! | `CORRELAY_DATABASE_URL` | `sqlite://./data/correlay.db?mode=rwc` | Store URL: `sqlite:` or `postgres://` |
//! | `CORRELAY_INSTANCE_ID` | generated | Recovery lock owner id |
//! | `CORRELAY_RECOVERY_ENABLED` | `true` | Run the recovery pass at boot |
//! | `CORRELAY_SWEEPER_ENABLED` | `true` | Run the request timeout sweeper |
//! | `CORRELAY_HTTP_PORT` | `8090` | Health/metrics port |
//! | `LOG_FORMAT` | `text` | Log output: `json` or `text` |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use cor_broker::{
    MemoryBroker, MessagePublisher, NatsBroker, NatsBrokerConfig, SubscriptionFactory,
};
use cor_config::AppConfig;
use cor_listener::{ListenerManager, ListenerSettings};
use cor_recovery::{RecoveryConfig, RecoveryCoordinator, SweeperConfig, TimeoutSweeper};
use cor_store::{LockRepository, PostgresRequestStore, RequestRepository, SqliteRequestStore};

#[tokio::main]
async fn main() -> Result<()> {
    cor_common::logging::init_logging("cor-server");

    info!("Starting Correlay server");

    let config = AppConfig::load()?;
    let instance_id = if config.instance_id.is_empty() {
        format!("instance-{}", uuid::Uuid::new_v4())
    } else {
        config.instance_id.clone()
    };
    info!(
        instance_id = %instance_id,
        broker_mode = %config.broker.mode,
        "Configuration loaded"
    );

    // Install the recorder before any component emits counters
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics recorder: {e}"))?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (requests, locks) = create_store(&config).await?;
    let (factory, publisher) = create_broker(&config).await?;

    let settings = ListenerSettings {
        batch_size: config.listener.batch_size,
        max_wait: Duration::from_millis(config.listener.max_wait_ms),
        poll_interval: Duration::from_millis(config.listener.poll_interval_ms),
        ack_wait: Duration::from_secs(config.listener.ack_wait_secs),
        max_deliver: config.listener.max_deliver,
        max_ack_pending: config.listener.max_ack_pending,
        ack_unmatched: config.listener.ack_unmatched,
        default_timeout: Duration::from_millis(config.listener.default_timeout_ms.max(0) as u64),
    };
    let manager = Arc::new(ListenerManager::new(
        requests.clone(),
        factory,
        publisher,
        settings,
    ));

    // One recovery pass per boot; losing the lock race just means another
    // instance is already rebuilding listeners.
    if config.recovery.enabled {
        let coordinator = RecoveryCoordinator::new(
            requests.clone(),
            locks,
            manager.clone(),
            instance_id.clone(),
            RecoveryConfig {
                lock_key: config.recovery.lock_key.clone(),
                lock_ttl: Duration::from_secs(config.recovery.lock_ttl_secs),
            },
        );
        match coordinator.run_once().await {
            Ok(outcome) => info!(outcome = ?outcome, "Boot recovery pass finished"),
            Err(e) => error!(error = %e, "Boot recovery pass failed"),
        }
    } else {
        info!("Recovery pass disabled");
    }

    let sweeper_handle = if config.sweeper.enabled {
        let sweeper = TimeoutSweeper::new(
            requests.clone(),
            SweeperConfig {
                enabled: true,
                check_interval: Duration::from_secs(config.sweeper.check_interval_secs),
                batch_size: config.sweeper.batch_size,
            },
        );
        let mut shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = sweeper.run() => {}
                _ = shutdown_rx.recv() => {
                    info!("Timeout sweeper shutting down");
                }
            }
        }))
    } else {
        info!("Timeout sweeper disabled");
        None
    };

    // Health/metrics port
    let http_addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(prometheus);

    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!("Health server listening on http://{}/health", http_addr);

    let http_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(http_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("Correlay server started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    manager.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        if let Some(handle) = sweeper_handle {
            let _ = handle.await;
        }
        let _ = http_handle.await;
    })
    .await;

    info!("Correlay server shutdown complete");
    Ok(())
}

async fn create_store(
    config: &AppConfig,
) -> Result<(Arc<dyn RequestRepository>, Arc<dyn LockRepository>)> {
    let url = config.store.url.as_str();
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = Arc::new(PostgresRequestStore::new(url, config.store.max_connections).await?);
        store.init_schema().await?;
        info!("Using PostgreSQL request store");
        let requests: Arc<dyn RequestRepository> = store.clone();
        let locks: Arc<dyn LockRepository> = store;
        Ok((requests, locks))
    } else if url.starts_with("sqlite:") {
        let store = Arc::new(SqliteRequestStore::new(url, config.store.max_connections).await?);
        store.init_schema().await?;
        info!(url = %url, "Using SQLite request store");
        let requests: Arc<dyn RequestRepository> = store.clone();
        let locks: Arc<dyn LockRepository> = store;
        Ok((requests, locks))
    } else {
        Err(anyhow::anyhow!(
            "Unsupported store URL: {}. Use sqlite: or postgres://",
            url
        ))
    }
}

async fn create_broker(
    config: &AppConfig,
) -> Result<(Arc<dyn SubscriptionFactory>, Arc<dyn MessagePublisher>)> {
    match config.broker.mode.as_str() {
        "nats" => {
            let broker = NatsBroker::connect(NatsBrokerConfig {
                url: config.broker.url.clone(),
                stream_name: config.broker.stream_name.clone(),
                stream_subjects: config.broker.stream_subjects.clone(),
            })
            .await?;
            info!(
                url = %config.broker.url,
                stream = %config.broker.stream_name,
                "Connected to NATS JetStream"
            );
            let factory: Arc<dyn SubscriptionFactory> = Arc::new(broker.clone());
            let publisher: Arc<dyn MessagePublisher> = Arc::new(broker);
            Ok((factory, publisher))
        }
        "embedded" => {
            let broker = MemoryBroker::new();
            info!("Using embedded in-memory broker");
            let factory: Arc<dyn SubscriptionFactory> = Arc::new(broker.clone());
            let publisher: Arc<dyn MessagePublisher> = Arc::new(broker);
            Ok((factory, publisher))
        }
        other => Err(anyhow::anyhow!(
            "Unknown broker mode: {}. Use embedded or nats",
            other
        )),
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn metrics_handler(State(prometheus): State<PrometheusHandle>) -> String {
    prometheus.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
