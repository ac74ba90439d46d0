//! Shared primitives for the duplex HTTP channel.
//!
//! Both the server and the client depend on this crate so that the wire
//! grammar, handshake payloads and error classification live in a single
//! place. It intentionally stays free of any runtime or HTTP dependency.

pub mod codec;
pub mod map;

pub use codec::{
    array_chunk_len, decode_arrays, decode_maps, encode_frame_chunks, encode_frames, encode_maps,
    BackFrame, ChunkDecoder, CodecError, ForwardBatch, InboundArray, MAX_CHUNK_LEN,
};
pub use map::{Map, MapError};

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Protocol revision spoken by this implementation. Handshakes advertising a
/// different value are rejected by the server.
pub const PROTOCOL_VERSION: u16 = 8;

/// Opaque session token handed out by the server during the handshake.
///
/// Rendered as 32 lowercase hex characters on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new_random() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Closed set of failure classes surfaced by the channel.
///
/// `Stop` is the normal end-of-channel signal sent by the server; it is part
/// of the set so that callers can match exhaustively, but it is never
/// reported as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Stop,
    Timeout,
    BadFormat,
    Protocol,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Stop => "stop",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BadFormat => "bad_format",
            ErrorKind::Protocol => "protocol",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, ErrorKind::Stop)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of the handshake POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub client_version: String,
    pub base_url: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
}

impl ConnectRequest {
    pub fn new(client_version: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client_version: client_version.into(),
            base_url: base_url.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

/// Handshake reply carrying the freshly minted session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: SessionId,
    pub protocol_version: u16,
}

/// Acknowledgment returned for every forward-channel POST.
///
/// Mirrors what the server knows about the session: whether a back channel is
/// attached, the last array sequence id flushed to it and how many arrays are
/// still waiting for an acknowledgment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub back_channel: bool,
    pub last_array_seq: u64,
    pub outstanding: usize,
}

/// How the back channel response is held open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackChannelMode {
    /// Chunks are streamed on one response until the server recycles it.
    #[default]
    Stream,
    /// The response completes after the first flush; the client re-polls.
    Poll,
}

impl BackChannelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackChannelMode::Stream => "stream",
            BackChannelMode::Poll => "poll",
        }
    }
}

/// Value of the `type` query parameter asking the server to drop a session.
pub const TERMINATE_QUERY_TYPE: &str = "terminate";

/// Body of a network test response. The server flushes the first piece at
/// once and the second after a pause, so a client that receives both in one
/// read sits behind a buffering proxy.
pub const NETWORK_TEST_FIRST: &str = "11111";
pub const NETWORK_TEST_SECOND: &str = "2";

/// Machine-readable error codes used in 4xx response bodies.
pub mod error_codes {
    pub const UNKNOWN_SESSION: &str = "unknown_session";
    pub const BAD_MAP: &str = "bad_map";
    pub const UNSUPPORTED_VERSION: &str = "unsupported_version";
    pub const BAD_REQUEST: &str = "bad_request";
}
