use bytes::Bytes;
use channel_proto::InboundArray;
use tracing::{debug, warn};

use crate::{Channel, ChannelError};

/// Identifies a timer started with [`Channel::start_timer`] when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u32);

/// Application callbacks for one channel.
///
/// Callbacks run on the channel's driver task, one at a time and in event
/// order. They may call back into the channel (`send_map`, `disconnect`,
/// `start_timer`); such calls are queued and processed after the callback
/// returns. Exactly one of `on_error` or `on_closed` is invoked per channel.
pub trait ChannelHandler: Send + 'static {
    fn on_open(&mut self, _channel: &Channel) {}

    fn on_array(&mut self, _channel: &Channel, array: &InboundArray) {
        debug!(seq = array.sequence_id, "array ignored by handler");
    }

    fn on_bad_map(&mut self, _channel: &Channel, raw: &Bytes) {
        warn!(len = raw.len(), "malformed back channel chunk");
    }

    fn on_timer(&mut self, _channel: &Channel, _timer: TimerId) {}

    fn on_error(&mut self, _channel: &Channel, error: &ChannelError) {
        warn!(kind = %error.kind(), error = %error, "channel failed");
    }

    fn on_closed(&mut self, _channel: &Channel) {}
}
