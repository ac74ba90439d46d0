//! HTTP exchanges the channel needs, behind a trait so tests can script them.

pub mod http;
pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use channel_proto::{BackChannelMode, ConnectRequest, ConnectResponse, Map, SessionId, SessionStatus};
use futures_util::Stream;

use crate::TransportError;

/// Raw back channel body, delivered in whatever slices the network produces.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    /// `POST <forward_path>` without a session id.
    async fn handshake(
        &self,
        forward_path: &str,
        request: &ConnectRequest,
    ) -> Result<ConnectResponse, TransportError>;

    /// `POST <forward_path>?sid=..` carrying `maps`, the first of which has
    /// index `ofs` in the session's forward stream.
    async fn post_maps(
        &self,
        forward_path: &str,
        session: SessionId,
        ofs: u64,
        maps: &[Map],
    ) -> Result<SessionStatus, TransportError>;

    /// `GET <back_path>?sid=..[&since=N]`; resolves once response headers
    /// arrived.
    async fn open_back_channel(
        &self,
        back_path: &str,
        session: SessionId,
        since: Option<u64>,
        mode: BackChannelMode,
    ) -> Result<ByteStream, TransportError>;

    async fn terminate(&self, forward_path: &str, session: SessionId) -> Result<(), TransportError>;

    /// `GET <test_path>?ver=..`; the body is returned as it arrives so the
    /// caller can see how the server's writes were grouped.
    async fn network_test(&self, test_path: &str) -> Result<ByteStream, TransportError>;
}
