//! hrpcd - standalone hrpc server.
//!
//! Serves a trivial echo dispatcher over the hrpc wire protocol; useful for
//! smoke testing clients, load generators, and deployment plumbing. Real
//! deployments embed `hrpc_server::Server` with their own dispatcher.

use bytes::Bytes;
use hrpc_server::{metrics, CallContext, Config, RpcService, Server, ServiceError};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Echoes every request body back to the caller.
struct EchoService;

impl RpcService for EchoService {
    type Request = Bytes;
    type Response = Bytes;

    fn call(&self, request: Bytes, ctx: &mut CallContext) -> Result<Bytes, ServiceError> {
        ctx.charge_response_bytes(request.len() as u64)?;
        if let Some(profiling) = ctx.profiling_mut() {
            profiling.record("echo_bytes", request.len() as i64);
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if HRPC_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("HRPC_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var("HRPC_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting hrpcd");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Protocol version: {}", hrpc_protocol::CURRENT_VERSION);
    tracing::info!("  Handlers: {}", config.rpc.handler_count);
    tracing::info!(
        "  Response queue ceiling: {} bytes",
        config.limits.response_queues_max_bytes
    );

    let metrics_config = config.metrics.clone();
    let server = Arc::new(Server::bind(config, EchoService).await?);
    tracing::info!("Listening on {}", server.local_addr());

    if metrics_config.enabled {
        let (metrics_shutdown_tx, metrics_shutdown_rx) = tokio::sync::broadcast::channel(1);
        {
            let server = server.clone();
            tokio::spawn(async move {
                server.join().await;
                let _ = metrics_shutdown_tx.send(());
            });
        }
        tokio::spawn(metrics::run_metrics_server(
            metrics_config.bind_addr,
            server.metrics(),
            metrics_shutdown_rx,
        ));
    }

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;
    tracing::info!("Server stopped");
    Ok(())
}
