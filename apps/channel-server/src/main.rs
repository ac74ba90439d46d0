use anyhow::Result;
use channel_server::{telemetry::Telemetry, Cli, ServerConfig};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        forward_path = %config.paths.forward,
        back_path = %config.paths.back,
        tick_secs = config.demo.tick_interval.as_secs(),
        lifetime_secs = config.demo.lifetime.as_secs(),
        "starting channel-server"
    );

    channel_server::run(config, Some(telemetry.metrics_handle())).await
}
