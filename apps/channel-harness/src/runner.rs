use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use channel_client::{Channel, ChannelConfig, ChannelTransport};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    completion::{Completion, CompletionSignal},
    scenarios::{EchoScenario, LivenessScenario, StopScenario},
};

/// How long a finished test waits for its channel to reach a terminal state.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCase {
    /// Tests `1` and `2`: send `{id}` and stay alive on server arrays.
    Liveness(String),
    Echo,
    Stop,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown test {0:?} (expected 1, 2, echo or stop)")]
pub struct UnknownTest(String);

impl FromStr for TestCase {
    type Err = UnknownTest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            id @ ("1" | "2") => Ok(TestCase::Liveness(id.to_string())),
            "echo" => Ok(TestCase::Echo),
            "stop" => Ok(TestCase::Stop),
            other => Err(UnknownTest(other.to_string())),
        }
    }
}

impl TestCase {
    pub fn id(&self) -> &str {
        match self {
            TestCase::Liveness(id) => id,
            TestCase::Echo => "echo",
            TestCase::Stop => "stop",
        }
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub channel: ChannelConfig,
    pub forward_path: String,
    pub back_path: String,
    /// Longest gap between arrays the liveness tests accept.
    pub liveness: Duration,
    pub echo_count: u64,
    pub echo_timeout: Duration,
    pub stop_deadline: Duration,
    /// Hard limit for one test, whatever its handler does.
    pub test_timeout: Duration,
}

impl RunnerConfig {
    pub fn new(channel: ChannelConfig) -> Self {
        Self {
            channel,
            forward_path: "channel/bind".into(),
            back_path: "channel/bind".into(),
            liveness: Duration::from_secs(25),
            echo_count: 10,
            echo_timeout: Duration::from_secs(5),
            stop_deadline: Duration::from_secs(10),
            test_timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub id: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
}

impl Summary {
    pub fn from_outcomes(outcomes: &[TestOutcome]) -> Self {
        let passed = outcomes.iter().filter(|outcome| outcome.success).count();
        Self {
            passed,
            failed: outcomes.len() - passed,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Runs one test on its own channel and waits for its completion signal.
/// Everything it logs is tagged with the test id.
pub async fn run_test(
    case: &TestCase,
    config: &RunnerConfig,
    transport: Arc<dyn ChannelTransport>,
) -> TestOutcome {
    let span = info_span!("test", id = case.id());
    async move {
        info!(url = %config.channel.base_url, "starting test");
        let (completion, done) = Completion::new();
        let channel = open_channel(case, config, transport, completion);

        let connected = channel.connect(config.forward_path.as_str(), config.back_path.as_str());
        let signal = match connected {
            Ok(()) => match timeout(config.test_timeout, done.wait()).await {
                Ok(signal) => signal,
                Err(_) => {
                    error!(timeout_secs = config.test_timeout.as_secs(), "test timed out");
                    CompletionSignal { success: false }
                }
            },
            Err(err) => {
                error!(error = %err, "could not connect");
                CompletionSignal { success: false }
            }
        };

        channel.disconnect();
        if timeout(CLOSE_GRACE, channel.closed()).await.is_err() {
            warn!("channel did not reach a terminal state");
        }
        info!(success = signal.success, "done");
        TestOutcome {
            id: case.id().to_string(),
            success: signal.success,
        }
    }
    .instrument(span)
    .await
}

/// Runs every test concurrently; outcomes come back in `cases` order.
pub async fn run_all(
    cases: &[TestCase],
    config: &RunnerConfig,
    transport: Arc<dyn ChannelTransport>,
) -> Vec<TestOutcome> {
    join_all(
        cases
            .iter()
            .map(|case| run_test(case, config, Arc::clone(&transport))),
    )
    .await
}

fn open_channel(
    case: &TestCase,
    config: &RunnerConfig,
    transport: Arc<dyn ChannelTransport>,
    completion: Completion,
) -> Channel {
    let channel_config = config.channel.clone();
    match case {
        TestCase::Liveness(id) => Channel::new(
            channel_config,
            transport,
            LivenessScenario::new(id.clone(), config.liveness, completion),
        ),
        TestCase::Echo => Channel::new(
            channel_config,
            transport,
            EchoScenario::new(config.echo_count, config.echo_timeout, completion),
        ),
        TestCase::Stop => Channel::new(
            channel_config,
            transport,
            StopScenario::new(config.stop_deadline, completion),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_test_ids() {
        assert_eq!("1".parse::<TestCase>(), Ok(TestCase::Liveness("1".into())));
        assert_eq!(" 2 ".parse::<TestCase>(), Ok(TestCase::Liveness("2".into())));
        assert_eq!("echo".parse::<TestCase>(), Ok(TestCase::Echo));
        assert_eq!(TestCase::Stop.to_string(), "stop");
        assert_eq!("3".parse::<TestCase>(), Err(UnknownTest("3".into())));
    }

    #[test_timeout::timeout]
    fn summary_counts_failures() {
        let outcome = |id: &str, success| TestOutcome {
            id: id.into(),
            success,
        };
        let outcomes = [outcome("1", true), outcome("2", false)];
        let summary = Summary::from_outcomes(&outcomes);
        assert_eq!(summary, Summary { passed: 1, failed: 1 });
        assert!(!summary.all_passed());
        assert!(Summary::from_outcomes(&[]).all_passed());
    }
}
