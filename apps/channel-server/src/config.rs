use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use axum::http::HeaderValue;
use clap::Parser;

use crate::{demo::DemoConfig, session::SessionConfig};

#[derive(Debug, Parser)]
#[command(
    name = "channel-server",
    author,
    version,
    about = "Duplex HTTP channel server with a demo echo/ticker service"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "CHANNEL_SERVER_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Path receiving handshakes, forward maps and terminate requests.
    #[arg(long, env = "CHANNEL_SERVER_FORWARD_PATH", default_value = "channel/bind")]
    pub forward_path: String,

    /// Path serving back channel responses.
    #[arg(long, env = "CHANNEL_SERVER_BACK_PATH", default_value = "channel/bind")]
    pub back_path: String,

    /// Path answering the client's buffering-proxy check.
    #[arg(long, env = "CHANNEL_SERVER_TEST_PATH", default_value = "channel/test")]
    pub test_path: String,

    /// Pause between the two halves of a network test response.
    #[arg(long, env = "CHANNEL_SERVER_NETWORK_TEST_DELAY_MS", default_value_t = 2000)]
    pub network_test_delay_ms: u64,

    /// Origin allowed to call the channel cross-domain (with credentials).
    #[arg(long, env = "CHANNEL_SERVER_CORS_ORIGIN")]
    pub cors_origin: Option<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CHANNEL_SERVER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "CHANNEL_SERVER_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    #[arg(long, env = "CHANNEL_SERVER_BACK_CHANNEL_MAX_AGE_SECS", default_value_t = 60)]
    pub back_channel_max_age_secs: u64,

    #[arg(long, env = "CHANNEL_SERVER_ACK_TIMEOUT_SECS", default_value_t = 60)]
    pub ack_timeout_secs: u64,

    /// Sessions without a back channel for this long are reclaimed.
    #[arg(long, env = "CHANNEL_SERVER_REOPEN_WINDOW_SECS", default_value_t = 20)]
    pub reopen_window_secs: u64,

    /// Interval between the demo service's tick arrays.
    #[arg(long, env = "CHANNEL_SERVER_TICK_SECS", default_value_t = 15)]
    pub tick_secs: u64,

    /// The demo service closes each channel after this long.
    #[arg(long, env = "CHANNEL_SERVER_CHANNEL_LIFETIME_SECS", default_value_t = 300)]
    pub channel_lifetime_secs: u64,

    /// Relay maps without a `payload` key to every connected channel.
    #[arg(long, env = "CHANNEL_SERVER_BROADCAST", default_value_t = false)]
    pub broadcast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pub forward: String,
    pub back: String,
    pub test: String,
}

impl ChannelPaths {
    pub fn new(forward: &str, back: &str, test: &str) -> Result<Self> {
        let paths = Self {
            forward: route_path(forward)?,
            back: route_path(back)?,
            test: route_path(test)?,
        };
        if paths.test == paths.forward || paths.test == paths.back {
            bail!("network test path {} must differ from the channel paths", paths.test);
        }
        Ok(paths)
    }

    pub fn shared(&self) -> bool {
        self.forward == self.back
    }
}

impl Default for ChannelPaths {
    fn default() -> Self {
        Self {
            forward: "/channel/bind".into(),
            back: "/channel/bind".into(),
            test: "/channel/test".into(),
        }
    }
}

fn route_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        bail!("channel path must not be empty");
    }
    if trimmed.contains(':') || trimmed.contains('*') {
        bail!("channel path {raw:?} must not contain route parameters");
    }
    Ok(format!("/{trimmed}"))
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub paths: ChannelPaths,
    pub cors_origin: Option<HeaderValue>,
    pub shutdown_grace: Duration,
    pub network_test_delay: Duration,
    pub session: SessionConfig,
    pub demo: DemoConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            paths: ChannelPaths::default(),
            cors_origin: None,
            shutdown_grace: Duration::from_secs(5),
            network_test_delay: Duration::from_secs(2),
            session: SessionConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let paths = ChannelPaths::new(&cli.forward_path, &cli.back_path, &cli.test_path)?;
        let cors_origin = cli
            .cors_origin
            .map(|origin| {
                HeaderValue::from_str(&origin)
                    .with_context(|| format!("invalid CORS origin: {origin}"))
            })
            .transpose()?;
        if cli.tick_secs == 0 {
            bail!("tick interval must be at least one second");
        }

        let session = SessionConfig {
            heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
            back_channel_max_age: Duration::from_secs(cli.back_channel_max_age_secs),
            ack_timeout: Duration::from_secs(cli.ack_timeout_secs),
            reopen_window: Duration::from_secs(cli.reopen_window_secs),
            ..SessionConfig::default()
        };
        let demo = DemoConfig {
            tick_interval: Duration::from_secs(cli.tick_secs),
            lifetime: Duration::from_secs(cli.channel_lifetime_secs),
            broadcast: cli.broadcast,
        };

        Ok(ServerConfig {
            listen_addr,
            paths,
            cors_origin,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            network_test_delay: Duration::from_millis(cli.network_test_delay_ms),
            session,
            demo,
        })
    }
}
