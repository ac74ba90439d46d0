//! Client side of the duplex HTTP channel.
//!
//! A [`Channel`] owns one session with the server. Maps sent with
//! [`Channel::send_map`] travel on the forward channel (one POST in flight at
//! a time), arrays pushed by the server arrive on a long-lived back channel
//! and are handed to the bound [`ChannelHandler`] strictly in sequence order.
//!
//! Everything that can change the channel state (handshake completion,
//! forward/back channel outcomes, timers, application commands) is funnelled
//! through a single driver task, so handler callbacks never race each other.

mod back;
pub mod channel;
pub mod config;
pub mod error;
mod forward;
pub mod handler;
mod network_test;
pub mod state;
pub mod timer;
pub mod transport;

pub use channel::Channel;
pub use config::{Backoff, ChannelConfig};
pub use error::{ChannelError, ProtocolViolation, TransportError, UsageError};
pub use handler::{ChannelHandler, TimerId};
pub use state::ChannelState;
pub use timer::{Timer, TimerHandle};
pub use transport::{http::HttpTransport, ByteStream, ChannelTransport};

pub use channel_proto::{BackChannelMode, ErrorKind, InboundArray, Map, SessionId};
