//! Buffering-proxy check run before the handshake when configured.

use std::time::Duration;

use bytes::BytesMut;
use channel_proto::{BackChannelMode, NETWORK_TEST_FIRST, NETWORK_TEST_SECOND};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::{ChannelTransport, TransportError};

/// Reads the network test response on `test_path` and picks a back channel
/// mode. Streaming is only chosen when the first half of the body arrived on
/// its own before the second. A missing second half within `timeout` means
/// something holds the response back, so the channel polls.
pub(crate) async fn detect_back_channel_mode(
    transport: &dyn ChannelTransport,
    test_path: &str,
    timeout: Duration,
) -> Result<BackChannelMode, TransportError> {
    let mut body = transport.network_test(test_path).await?;
    let expected = [NETWORK_TEST_FIRST, NETWORK_TEST_SECOND].concat();

    let read = async {
        let mut received = BytesMut::new();
        let mut first_alone = false;
        while let Some(piece) = body.next().await {
            received.extend_from_slice(&piece?);
            if &received[..] == NETWORK_TEST_FIRST.as_bytes() {
                first_alone = true;
            }
            if received.len() >= expected.len() {
                break;
            }
        }
        Ok::<_, TransportError>((received, first_alone))
    };

    let mode = match tokio::time::timeout(timeout, read).await {
        Err(_) => {
            info!(timeout_ms = timeout.as_millis() as u64, "network test stalled, polling instead");
            BackChannelMode::Poll
        }
        Ok(Err(err)) => return Err(err),
        Ok(Ok((received, _))) if &received[..] != expected.as_bytes() => {
            warn!(
                body = %String::from_utf8_lossy(&received),
                "unexpected network test body, polling instead"
            );
            BackChannelMode::Poll
        }
        Ok(Ok((_, true))) => BackChannelMode::Stream,
        Ok(Ok((_, false))) => {
            info!("network test body arrived in one piece, polling instead");
            BackChannelMode::Poll
        }
    };
    debug!(mode = mode.as_str(), "network test finished");
    Ok(mode)
}
