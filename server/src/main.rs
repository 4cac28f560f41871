//! Order ingestion service.
//!
//! One process runs both halves of the pipeline: the HTTP surface that
//! queues submissions and serves the read API, and the consumer that turns
//! queued submissions into stored orders.
//!
//! Run with: `cargo run --bin order-service`
//! Migrations only: `cargo run --bin order-service -- --migrate`

mod config;

use anyhow::Context;
use config::{Environment, ServiceConfig};
use order_ingest_amqp::AmqpGateway;
use order_ingest_core::{OrderStore, QueueGateway, environment::SystemClock};
use order_ingest_postgres::PostgresOrderStore;
use order_ingest_runtime::{
    ConsumerConfig, OrderConsumer, OrderProcessor, OrderProducer, RetryPolicy, metrics,
};
use order_ingest_web::{AppState, router};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    let migrate_only = std::env::args().skip(1).any(|arg| arg == "--migrate");
    info!(
        environment = %config.environment,
        http = %config.http_bind_addr,
        prefetch = config.amqp.prefetch,
        "Configuration loaded"
    );

    let store = PostgresOrderStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to the database")?;
    info!("Database connected");

    if migrate_only {
        store.migrate().await?;
        info!("Migrations applied, exiting");
        return Ok(());
    }
    if config.environment == Environment::Development {
        store.migrate().await?;
    }

    let metrics_handle = metrics::install()?;

    let gateway = AmqpGateway::new(&config.amqp.url);
    info!(broker = %gateway.redacted_uri(), "Queue gateway configured");
    let gateway: Arc<dyn QueueGateway> = Arc::new(gateway);
    let store: Arc<dyn OrderStore> = Arc::new(store);

    let commit_retry = RetryPolicy::builder()
        .max_retries(config.commit_retries)
        .build();
    let processor = Arc::new(
        OrderProcessor::new(Arc::clone(&store), Arc::new(SystemClock)).with_commit_retry(commit_retry),
    );
    let consumer_config = ConsumerConfig::default()
        .with_prefetch(config.amqp.prefetch)
        .with_reconnect_interval(config.amqp.reconnect_interval)
        .with_throughput_log_interval(config.throughput_log_interval)
        .with_shutdown_grace(config.shutdown_grace);
    let (consumer, stop_consumer) =
        OrderConsumer::new(Arc::clone(&gateway), processor, consumer_config);
    let consumer_state = consumer.state();
    let mut consumer_task = tokio::spawn(consumer.run());

    let state = AppState::new(
        OrderProducer::new(gateway),
        store,
        consumer_state,
        metrics_handle,
    );
    let listener = tokio::net::TcpListener::bind(config.http_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind_addr))?;
    info!(addr = %config.http_bind_addr, "HTTP server listening");

    let (stop_server, mut server_stopping) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                let _ = server_stopping.wait_for(|stop| *stop).await;
            })
            .await
    });

    // A consumer that exits on its own (topology mismatch) takes the server down.
    let consumer_result = tokio::select! {
        () = shutdown_signal() => None,
        joined = &mut consumer_task => {
            error!("Order consumer exited, shutting down");
            Some(joined)
        }
    };

    let _ = stop_server.send(true);
    server
        .await
        .context("HTTP server task failed")?
        .context("HTTP server failed")?;
    info!("HTTP server stopped");

    let _ = stop_consumer.send(true);
    let joined = match consumer_result {
        Some(joined) => joined,
        None => consumer_task.await,
    };
    match joined {
        Ok(Ok(())) => {
            info!("Order service stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("order consumer failed"),
        Err(e) => {
            warn!(error = %e, "Consumer task did not finish cleanly");
            Err(e).context("order consumer task failed")
        }
    }
}

/// Graceful shutdown signal handler.
///
/// Waits for:
/// - Ctrl+C (SIGINT)
/// - SIGTERM (on unix)
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
