//! Channel handlers, one per test case. Each reports into a [`Completion`]
//! exactly once; later reports are ignored.

use std::time::Duration;

use bytes::Bytes;
use channel_client::{
    Channel, ChannelError, ChannelHandler, InboundArray, Map, TimerHandle, TimerId,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::completion::Completion;

const LIVENESS_TIMER: TimerId = TimerId(1);
const ECHO_TIMER: TimerId = TimerId(2);
const STOP_TIMER: TimerId = TimerId(3);

fn send(channel: &Channel, key: &str, value: impl Into<Value>) -> bool {
    let map = match Map::new().with(key, value) {
        Ok(map) => map,
        Err(err) => {
            error!(error = %err, "could not build map");
            return false;
        }
    };
    match channel.send_map(map) {
        Ok(()) => true,
        Err(err) => {
            error!(error = %err, "could not send map");
            false
        }
    }
}

/// Sends `{id}` on open and expects the server to keep pushing arrays: the
/// test fails once no array arrived for `liveness`, and succeeds when the
/// server ends the channel.
pub struct LivenessScenario {
    id: String,
    liveness: Duration,
    timer: Option<TimerHandle>,
    completion: Completion,
}

impl LivenessScenario {
    pub fn new(id: impl Into<String>, liveness: Duration, completion: Completion) -> Self {
        Self {
            id: id.into(),
            liveness,
            timer: None,
            completion,
        }
    }

    fn fail(&mut self, channel: &Channel) {
        if self.completion.report(false) {
            channel.disconnect();
        }
    }
}

impl ChannelHandler for LivenessScenario {
    fn on_open(&mut self, channel: &Channel) {
        info!("channel opened");
        if !send(channel, "id", self.id.as_str()) {
            self.fail(channel);
            return;
        }
        self.timer = Some(channel.start_timer(LIVENESS_TIMER, self.liveness, false));
    }

    fn on_array(&mut self, _channel: &Channel, array: &InboundArray) {
        info!(seq = array.sequence_id, payload = ?array.payload, "array received");
        if let Some(timer) = &self.timer {
            timer.reset();
        }
    }

    fn on_bad_map(&mut self, channel: &Channel, raw: &Bytes) {
        error!(bytes = raw.len(), "malformed back channel chunk");
        self.fail(channel);
    }

    fn on_timer(&mut self, channel: &Channel, timer: TimerId) {
        if timer == LIVENESS_TIMER {
            error!(liveness_secs = self.liveness.as_secs(), "no array within the liveness window");
            self.fail(channel);
        }
    }

    fn on_error(&mut self, _channel: &Channel, error: &ChannelError) {
        error!(kind = %error.kind(), %error, "channel failed");
        self.completion.report(false);
    }

    fn on_closed(&mut self, _channel: &Channel) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        info!("channel closed");
        self.completion.report(true);
    }
}

/// Sends `{payload: i}` for `i` in `0..count`, one at a time, each of which
/// must be echoed back as `[i]` within `ack_timeout`. Disconnects and
/// succeeds after the last echo.
pub struct EchoScenario {
    count: u64,
    next: u64,
    ack_timeout: Duration,
    timer: Option<TimerHandle>,
    completion: Completion,
}

impl EchoScenario {
    pub fn new(count: u64, ack_timeout: Duration, completion: Completion) -> Self {
        Self {
            count,
            next: 0,
            ack_timeout,
            timer: None,
            completion,
        }
    }

    fn finish(&mut self, channel: &Channel, success: bool) {
        if let Some(timer) = &self.timer {
            timer.stop();
        }
        self.completion.report(success);
        channel.disconnect();
    }

    fn send_next(&mut self, channel: &Channel) {
        if !send(channel, "payload", self.next) {
            self.finish(channel, false);
            return;
        }
        match &self.timer {
            Some(timer) => timer.restart(self.ack_timeout, false),
            None => self.timer = Some(channel.start_timer(ECHO_TIMER, self.ack_timeout, false)),
        }
    }
}

impl ChannelHandler for EchoScenario {
    fn on_open(&mut self, channel: &Channel) {
        info!(count = self.count, "channel opened; starting echo round trips");
        if self.count == 0 {
            self.finish(channel, true);
            return;
        }
        self.send_next(channel);
    }

    fn on_array(&mut self, channel: &Channel, array: &InboundArray) {
        let echoed = match array.payload.as_slice() {
            [Value::Number(number)] => number.as_u64(),
            _ => None,
        };
        let Some(echoed) = echoed else {
            debug!(seq = array.sequence_id, payload = ?array.payload, "ignoring unrelated array");
            return;
        };
        if echoed != self.next {
            error!(expected = self.next, got = echoed, "echo out of order");
            self.finish(channel, false);
            return;
        }

        info!(payload = echoed, "echo received");
        self.next += 1;
        if self.next == self.count {
            info!("all echoes received");
            self.finish(channel, true);
        } else {
            self.send_next(channel);
        }
    }

    fn on_bad_map(&mut self, channel: &Channel, raw: &Bytes) {
        error!(bytes = raw.len(), "malformed back channel chunk");
        self.finish(channel, false);
    }

    fn on_timer(&mut self, channel: &Channel, timer: TimerId) {
        if timer == ECHO_TIMER && !self.completion.is_reported() {
            error!(payload = self.next, "echo did not arrive in time");
            self.finish(channel, false);
        }
    }

    fn on_error(&mut self, _channel: &Channel, error: &ChannelError) {
        error!(kind = %error.kind(), %error, "channel failed");
        self.completion.report(false);
    }

    fn on_closed(&mut self, _channel: &Channel) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        if self.next < self.count {
            warn!(received = self.next, "channel closed before every echo arrived");
        }
        self.completion.report(self.next == self.count);
    }
}

/// Asks the server to end the channel with a `{stop: true}` map; succeeds
/// once the channel closes cleanly within `deadline`.
pub struct StopScenario {
    deadline: Duration,
    timer: Option<TimerHandle>,
    completion: Completion,
}

impl StopScenario {
    pub fn new(deadline: Duration, completion: Completion) -> Self {
        Self {
            deadline,
            timer: None,
            completion,
        }
    }
}

impl ChannelHandler for StopScenario {
    fn on_open(&mut self, channel: &Channel) {
        info!("channel opened; asking the server to stop");
        if !send(channel, "stop", true) {
            self.completion.report(false);
            channel.disconnect();
            return;
        }
        self.timer = Some(channel.start_timer(STOP_TIMER, self.deadline, false));
    }

    fn on_bad_map(&mut self, channel: &Channel, raw: &Bytes) {
        error!(bytes = raw.len(), "malformed back channel chunk");
        if self.completion.report(false) {
            channel.disconnect();
        }
    }

    fn on_timer(&mut self, channel: &Channel, timer: TimerId) {
        if timer == STOP_TIMER && self.completion.report(false) {
            error!("server did not stop the channel in time");
            channel.disconnect();
        }
    }

    fn on_error(&mut self, _channel: &Channel, error: &ChannelError) {
        error!(kind = %error.kind(), %error, "channel failed");
        self.completion.report(false);
    }

    fn on_closed(&mut self, _channel: &Channel) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        info!("channel closed by the server");
        self.completion.report(true);
    }
}
