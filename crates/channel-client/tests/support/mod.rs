#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use channel_client::{
    transport::mock::MockTransport, Channel, ChannelConfig, ChannelError, ChannelHandler,
    InboundArray, TimerId,
};
use tokio::sync::mpsc;

pub const FORWARD_PATH: &str = "channel/bind";
pub const BACK_PATH: &str = "channel/bind";

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Open,
    Array(InboundArray),
    BadMap(Bytes),
    Timer(TimerId),
    Error(ChannelError),
    Closed,
}

pub struct Recorder {
    tx: mpsc::UnboundedSender<Seen>,
}

impl ChannelHandler for Recorder {
    fn on_open(&mut self, _channel: &Channel) {
        let _ = self.tx.send(Seen::Open);
    }

    fn on_array(&mut self, _channel: &Channel, array: &InboundArray) {
        let _ = self.tx.send(Seen::Array(array.clone()));
    }

    fn on_bad_map(&mut self, _channel: &Channel, raw: &Bytes) {
        let _ = self.tx.send(Seen::BadMap(raw.clone()));
    }

    fn on_timer(&mut self, _channel: &Channel, timer: TimerId) {
        let _ = self.tx.send(Seen::Timer(timer));
    }

    fn on_error(&mut self, _channel: &Channel, error: &ChannelError) {
        let _ = self.tx.send(Seen::Error(error.clone()));
    }

    fn on_closed(&mut self, _channel: &Channel) {
        let _ = self.tx.send(Seen::Closed);
    }
}

pub struct Harness {
    pub channel: Channel,
    pub transport: Arc<MockTransport>,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        let transport = Arc::new(MockTransport::new());
        let (tx, seen) = mpsc::unbounded_channel();
        let channel = Channel::new(config, transport.clone(), Recorder { tx });
        Self {
            channel,
            transport,
            seen,
        }
    }

    pub fn connect(&self) {
        self.channel
            .connect(FORWARD_PATH, BACK_PATH)
            .expect("first connect");
    }

    pub async fn next(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(120), self.seen.recv())
            .await
            .expect("handler event")
            .expect("recorder alive")
    }

    /// Splits the harness so the test can drop the channel handle on its own.
    pub fn into_parts(self) -> (Channel, Arc<MockTransport>, mpsc::UnboundedReceiver<Seen>) {
        (self.channel, self.transport, self.seen)
    }

    /// Everything recorded so far, without waiting.
    pub fn drain(&mut self) -> Vec<Seen> {
        let mut out = Vec::new();
        while let Ok(seen) = self.seen.try_recv() {
            out.push(seen);
        }
        out
    }
}

pub fn test_config() -> ChannelConfig {
    ChannelConfig::new("cv-test", "http://channel.test/")
        .with_retry_delays(Duration::from_millis(100), Duration::from_secs(1))
}

pub fn map(key: &str, value: impl Into<serde_json::Value>) -> channel_client::Map {
    channel_client::Map::new()
        .with(key, value)
        .expect("scalar map value")
}
