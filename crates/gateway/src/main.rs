//! Gateway service entry point.
//!
//! One process per gateway instance: a WebSocket listener, a local
//! connection registry, a presence-store client, and one router transport.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gateway::{handler, server, AppState, ConnectionRegistry, GatewayConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use presence::PresenceStore;
use router::{GatewayRouter, KafkaConfig, KafkaLogRouter, RedisPubSubRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Inter-gateway transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// Ephemeral Redis pub/sub: at-most-once, lowest latency.
    Pubsub,
    /// Durable Kafka topics: at-least-once, survives restarts.
    Kafka,
}

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "Horizontally scalable WebSocket fan-out gateway")]
struct Args {
    /// Gateway id, unique within the cluster.
    #[arg(long)]
    id: String,

    /// HTTP listen port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Redis URL (presence store; also the pub/sub transport).
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Inter-gateway transport.
    #[arg(long, value_enum, default_value_t = Transport::Pubsub)]
    transport: Transport,

    /// Kafka bootstrap servers, comma-separated (kafka transport).
    #[arg(long, default_value = "localhost:9092")]
    kafka_brokers: String,

    /// Kafka consumer group (kafka transport).
    #[arg(long, default_value = "websocket-gateway")]
    kafka_group: String,

    /// Prometheus metrics port.
    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::new(args.id.clone(), args.port);

    info!(
        gateway_id = %config.gateway_id,
        port = config.port,
        transport = ?args.transport,
        "starting gateway"
    );

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], args.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!(port = args.metrics_port, "Prometheus metrics server started");

    let presence = PresenceStore::connect(&args.redis_url, config.presence_ttl())
        .await
        .context("failed to connect to Redis")?;
    info!("connected to Redis");

    let gateway_router: Arc<dyn GatewayRouter> = match args.transport {
        Transport::Pubsub => Arc::new(
            RedisPubSubRouter::connect(&args.redis_url, config.gateway_id.clone())
                .await
                .context("failed to create pub/sub router")?,
        ),
        Transport::Kafka => Arc::new(
            KafkaLogRouter::new(
                config.gateway_id.clone(),
                KafkaConfig::new(&args.kafka_brokers, &args.kafka_group),
            )
            .context("failed to create Kafka router")?,
        ),
    };

    let registry = Arc::new(ConnectionRegistry::new());

    let delivery_registry = registry.clone();
    gateway_router
        .start(Arc::new(move |msg| {
            handler::deliver(&delivery_registry, msg)
        }))
        .await
        .context("failed to start router")?;

    let state = Arc::new(AppState {
        config: config.clone(),
        registry,
        presence,
        router: gateway_router,
        shutdown: CancellationToken::new(),
    });

    let sweep = server::spawn_health_sweep(state.clone());

    let app = server::create_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    info!(%addr, "gateway listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Graceful HTTP shutdown only stops accepting; upgraded sockets
            // must be closed explicitly or serve would wait on them.
            shutdown_state.shutdown.cancel();
            shutdown_state.registry.for_each(|conn| conn.close());
        })
        .await
        .context("server error")?;

    if tokio::time::timeout(config.shutdown_grace, server::shutdown(&state))
        .await
        .is_err()
    {
        warn!("shutdown grace period elapsed before cleanup finished");
    }
    let _ = sweep.await;

    info!("gateway stopped");
    Ok(())
}

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
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
