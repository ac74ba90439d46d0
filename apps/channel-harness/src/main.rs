use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use channel_client::{BackChannelMode, ChannelConfig, HttpTransport};
use channel_harness::{run_all, RunnerConfig, Summary, TestCase};
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Stream,
    Poll,
    /// Picked by the network test on `--test-path`.
    Auto,
}

#[derive(Debug, Parser)]
#[command(
    name = "channel-harness",
    author,
    version,
    about = "Runs channel test scenarios against a channel-server"
)]
struct Cli {
    #[arg(long, env = "CHANNEL_HARNESS_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "CHANNEL_HARNESS_PORT", default_value_t = 8080)]
    port: u16,

    /// Comma separated test ids: 1, 2, echo, stop.
    #[arg(long, env = "CHANNEL_HARNESS_TESTS", default_value = "1,2", value_delimiter = ',')]
    tests: Vec<String>,

    #[arg(long, env = "CHANNEL_HARNESS_FORWARD_PATH", default_value = "channel/bind")]
    forward_path: String,

    #[arg(long, env = "CHANNEL_HARNESS_BACK_PATH", default_value = "channel/bind")]
    back_path: String,

    #[arg(long, env = "CHANNEL_HARNESS_TEST_PATH", default_value = "channel/test")]
    test_path: String,

    #[arg(long, env = "CHANNEL_HARNESS_MODE", value_enum, default_value_t = Mode::Stream)]
    mode: Mode,

    /// Seconds the liveness tests wait for the next array.
    #[arg(long, env = "CHANNEL_HARNESS_LIVENESS_SECS", default_value_t = 25)]
    liveness_secs: u64,

    /// Hard limit for each test.
    #[arg(long, env = "CHANNEL_HARNESS_TEST_TIMEOUT_SECS", default_value_t = 600)]
    test_timeout_secs: u64,
}

struct HarnessConfig {
    base_url: String,
    cases: Vec<TestCase>,
    runner: RunnerConfig,
}

impl TryFrom<Cli> for HarnessConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let cases = cli
            .tests
            .iter()
            .map(|id| id.parse::<TestCase>())
            .collect::<Result<Vec<_>, _>>()
            .context("invalid --tests")?;
        if cases.is_empty() {
            bail!("no tests selected");
        }

        let base_url = format!("http://{}:{}/", cli.host, cli.port);
        let channel = ChannelConfig::new("harness", base_url.as_str());
        let channel = match cli.mode {
            Mode::Stream => channel.with_back_channel_mode(BackChannelMode::Stream),
            Mode::Poll => channel.with_back_channel_mode(BackChannelMode::Poll),
            Mode::Auto => channel.with_network_test(cli.test_path),
        };
        let runner = RunnerConfig {
            forward_path: cli.forward_path,
            back_path: cli.back_path,
            liveness: Duration::from_secs(cli.liveness_secs),
            test_timeout: Duration::from_secs(cli.test_timeout_secs),
            ..RunnerConfig::new(channel)
        };
        Ok(Self {
            base_url,
            cases,
            runner,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(summary) if summary.all_passed() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = ?err, "harness failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<Summary> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let config = HarnessConfig::try_from(Cli::parse())?;
    let tests: Vec<&str> = config.cases.iter().map(TestCase::id).collect();
    info!(url = %config.base_url, ?tests, "running tests");

    let transport = HttpTransport::new(&config.base_url).context("invalid server url")?;
    let outcomes = run_all(&config.cases, &config.runner, Arc::new(transport)).await;

    let summary = Summary::from_outcomes(&outcomes);
    info!("all tests completed");
    info!(passed = summary.passed, failed = summary.failed, "summary");
    Ok(summary)
}
