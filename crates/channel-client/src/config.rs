use std::time::Duration;

use channel_proto::BackChannelMode;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_NETWORK_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for one client channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Application version string sent during the handshake.
    pub client_version: String,
    /// Base URL the forward and back paths are resolved against.
    pub base_url: String,
    pub back_channel_mode: BackChannelMode,
    /// When set, the back channel mode is chosen by a network test on this
    /// path before the handshake, overriding `back_channel_mode`.
    pub network_test_path: Option<String>,
    pub network_test_timeout: Duration,
    /// The channel fails with a timeout if it is not open by then.
    pub handshake_timeout: Duration,
    pub forward_max_attempts: u32,
    pub back_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_maps_per_post: usize,
    /// Malformed back-channel chunks tolerated before the channel fails.
    pub max_bad_frames: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            client_version: "cv1".to_string(),
            base_url: "http://127.0.0.1:8080/".to_string(),
            back_channel_mode: BackChannelMode::Stream,
            network_test_path: None,
            network_test_timeout: DEFAULT_NETWORK_TEST_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            forward_max_attempts: 3,
            back_max_attempts: 3,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            max_maps_per_post: 100,
            max_bad_frames: 1,
        }
    }
}

impl ChannelConfig {
    pub fn new(client_version: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client_version: client_version.into(),
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_back_channel_mode(mut self, mode: BackChannelMode) -> Self {
        self.back_channel_mode = mode;
        self
    }

    pub fn with_network_test(mut self, test_path: impl Into<String>) -> Self {
        self.network_test_path = Some(test_path.into());
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: self.retry_base_delay,
            max: self.retry_max_delay,
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
