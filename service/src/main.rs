//! Flash coupon fulfillment service.
//!
//! Connects Redis, `PostgreSQL` and Redpanda, exposes Prometheus metrics and
//! runs the fulfillment worker pool until shutdown.

use anyhow::Context;
use flashcoupon_runtime::metrics::MetricsServer;
use flashcoupon_service::{Config, Resources};
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // Missing .env is the normal case in containers.
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env file: {e}");
        }
    }
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting flash coupon service");
    info!(
        postgres_url = %redact(&config.postgres.url),
        redis_url = %redact(&config.redis.url),
        redpanda_brokers = %config.redpanda.brokers,
        workers = config.worker.pool_size,
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr = config
        .server
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid METRICS_ADDR '{}'", config.server.metrics_addr))?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.start().context("failed to start metrics server")?;

    let resources = Resources::from_config(&config).await?;

    let workers = resources
        .worker_pool(&config)?
        .start()
        .await
        .context("failed to subscribe fulfillment workers")?;
    info!(workers = workers.len(), "Service ready");

    shutdown_signal().await;

    if workers.shutdown(config.shutdown_timeout()).await {
        info!("Shutdown complete");
    } else {
        warn!("Shutdown timed out; unacknowledged deliveries will be redelivered");
    }
    Ok(())
}

/// Strip credentials from a connection URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***@{}", &url[..scheme], &url[at + 1..]),
        _ => url.to_string(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
