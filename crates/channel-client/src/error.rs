use channel_proto::{ErrorKind, SessionId};
use thiserror::Error;

/// Failure of a single HTTP exchange. The forward sender and back channel
/// receiver decide whether it is worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("server answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("server does not know the session")]
    UnknownSession,
    #[error("response body could not be read: {0}")]
    Body(String),
    #[error("invalid url: {0}")]
    Url(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() || err.is_decode() {
            TransportError::Body(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("array {got} arrived while {expected} was expected")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("server reclaimed or never knew the session")]
    UnknownSession,
    #[error("open frame names session {got}, handshake returned {expected}")]
    SessionMismatch { expected: SessionId, got: SessionId },
    #[error("{0} frame arrived before the channel opened")]
    FrameBeforeOpen(&'static str),
    #[error("server speaks protocol version {0}")]
    UnsupportedVersion(u16),
}

/// Terminal failure reported through `ChannelHandler::on_error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("transport failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("malformed back channel data: {0}")]
    BadFormat(String),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Transport { .. } => ErrorKind::Transport,
            ChannelError::Timeout(_) => ErrorKind::Timeout,
            ChannelError::BadFormat(_) => ErrorKind::BadFormat,
            ChannelError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    pub(crate) fn transport(attempts: u32, source: TransportError) -> Self {
        match source {
            TransportError::UnknownSession => ProtocolViolation::UnknownSession.into(),
            source => ChannelError::Transport { attempts, source },
        }
    }
}

/// Misuse of the `Channel` API. Returned synchronously, never routed through
/// the handler.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("channel is not open")]
    NotOpen,
    #[error("channel was already connected")]
    AlreadyConnected,
    #[error("channel driver has stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn unknown_session_is_a_protocol_failure() {
        let err = ChannelError::transport(2, TransportError::UnknownSession);
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let err = ChannelError::transport(3, TransportError::Network("reset".into()));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("3 attempt(s)"));
    }
}
