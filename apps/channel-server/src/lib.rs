//! Server half of the duplex HTTP channel.
//!
//! [`session::SessionRegistry`] owns every live session; [`routes`] maps the
//! forward and back channel requests onto it and [`demo`] is the application
//! mounted by the binary.

pub mod config;
pub mod demo;
pub mod queue;
pub mod routes;
pub mod session;
pub mod telemetry;

use std::future::Future;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

pub use config::{ChannelPaths, Cli, ServerConfig};
pub use demo::{DemoConfig, DemoService};
pub use session::{ServerChannel, SessionConfig, SessionError, SessionRegistry};

/// Binds `config.listen_addr` and serves until ctrl-c, then waits out the
/// shutdown grace period.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("channel-server listening on {}", config.listen_addr);

    let grace = config.shutdown_grace;
    serve(listener, config, metrics, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Serves the channel on an already bound listener until `shutdown`
/// resolves. The sweeper and the demo service live as long as the server.
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    metrics: Option<PrometheusHandle>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let registry = SessionRegistry::new(config.session.clone());
    let sweeper = registry.spawn_sweeper();
    let demo = DemoService::new(registry.clone(), config.demo.clone()).spawn();

    let state = routes::AppState::new(registry, metrics, config.network_test_delay);
    let router = routes::router(state, &config);
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error");

    sweeper.abort();
    demo.abort();
    result
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
