use std::sync::Arc;

use bytes::Bytes;
use channel_proto::{BackChannelMode, BackFrame, ChunkDecoder, InboundArray, SessionId};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{Backoff, ChannelConfig, ChannelError, ChannelTransport, ProtocolViolation, TransportError};

pub(crate) enum BackEvent {
    Opened,
    Array(InboundArray),
    Stop,
    BadChunk { raw: Bytes, error: String },
    Failed(ChannelError),
}

/// Keeps a back channel response open for the session, reconnecting with
/// `since=<last delivered seq>` whenever one ends.
///
/// Arrays at or below the last delivered sequence id are dropped as
/// redeliveries; anything other than `last + 1` above it is a protocol
/// failure.
pub(crate) struct BackReceiver {
    task: JoinHandle<()>,
}

impl BackReceiver {
    pub(crate) fn spawn<F>(
        transport: Arc<dyn ChannelTransport>,
        back_path: String,
        session: SessionId,
        config: &ChannelConfig,
        notify: F,
    ) -> Self
    where
        F: Fn(BackEvent) + Send + Sync + 'static,
    {
        let worker = Worker {
            transport,
            back_path,
            session,
            mode: config.back_channel_mode,
            max_attempts: config.back_max_attempts.max(1),
            backoff: config.backoff(),
            opened: false,
            last_seq: 0,
        };
        Self {
            task: tokio::spawn(worker.run(notify)),
        }
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Why one back channel response stopped being read.
enum Ended {
    /// The server finished the response (long-poll flush or recycling).
    Complete,
    Dropped(TransportError),
    /// A malformed chunk was skipped; the rest of this response can no
    /// longer be trusted to continue the sequence.
    Corrupt,
    /// Stop received or a fatal error was reported.
    Finished,
}

enum Flow {
    Continue,
    Finished,
}

struct Worker {
    transport: Arc<dyn ChannelTransport>,
    back_path: String,
    session: SessionId,
    mode: BackChannelMode,
    max_attempts: u32,
    backoff: Backoff,
    opened: bool,
    last_seq: u64,
}

impl Worker {
    async fn run<F>(mut self, notify: F)
    where
        F: Fn(BackEvent) + Send + Sync + 'static,
    {
        let mut failures: u32 = 0;
        loop {
            let since = self.opened.then_some(self.last_seq);
            let opened = self
                .transport
                .open_back_channel(&self.back_path, self.session, since, self.mode)
                .await;

            let (ended, progressed) = match opened {
                Ok(stream) => self.read(stream, &notify).await,
                Err(err) => (Ended::Dropped(err), false),
            };
            if progressed {
                failures = 0;
            }

            let error = match ended {
                Ended::Finished => return,
                Ended::Complete if progressed => {
                    trace!(session = %self.session, last_seq = self.last_seq, "back channel response complete");
                    continue;
                }
                Ended::Complete => TransportError::Body("back channel closed without data".into()),
                Ended::Corrupt => TransportError::Body("malformed chunk".into()),
                Ended::Dropped(TransportError::UnknownSession) => {
                    notify(BackEvent::Failed(ProtocolViolation::UnknownSession.into()));
                    return;
                }
                Ended::Dropped(err) => err,
            };

            failures += 1;
            if failures >= self.max_attempts {
                warn!(session = %self.session, failures, error = %error, "giving up on back channel");
                notify(BackEvent::Failed(ChannelError::transport(failures, error)));
                return;
            }
            let delay = self.backoff.delay(failures);
            info!(
                session = %self.session,
                since = self.last_seq,
                failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "reconnecting back channel"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn read<F>(&mut self, mut stream: crate::ByteStream, notify: &F) -> (Ended, bool)
    where
        F: Fn(BackEvent) + Sync,
    {
        let mut decoder = ChunkDecoder::new();
        let mut progressed = false;
        loop {
            let bytes = match stream.next().await {
                None if decoder.buffered() > 0 => {
                    debug!(leftover = decoder.buffered(), "back channel ended inside a chunk");
                    return (Ended::Corrupt, progressed);
                }
                None => return (Ended::Complete, progressed),
                Some(Err(err)) => return (Ended::Dropped(err), progressed),
                Some(Ok(bytes)) => bytes,
            };
            decoder.push(&bytes);

            loop {
                match decoder.next_chunk() {
                    Ok(None) => break,
                    Ok(Some(frames)) => {
                        progressed = true;
                        for frame in frames {
                            if let Flow::Finished = self.accept(frame, notify) {
                                return (Ended::Finished, progressed);
                            }
                        }
                    }
                    Err(chunk) => {
                        warn!(
                            session = %self.session,
                            error = %chunk.error,
                            framing_lost = chunk.framing_lost,
                            "dropping malformed back channel chunk"
                        );
                        notify(BackEvent::BadChunk {
                            raw: chunk.raw,
                            error: chunk.error.to_string(),
                        });
                        return (Ended::Corrupt, progressed);
                    }
                }
            }
        }
    }

    fn accept<F>(&mut self, frame: BackFrame, notify: &F) -> Flow
    where
        F: Fn(BackEvent) + Sync,
    {
        match frame {
            BackFrame::Open { session_id, version } => {
                if session_id != self.session {
                    notify(BackEvent::Failed(
                        ProtocolViolation::SessionMismatch {
                            expected: self.session,
                            got: session_id,
                        }
                        .into(),
                    ));
                    return Flow::Finished;
                }
                if !self.opened {
                    debug!(session = %self.session, version, "back channel open");
                    self.opened = true;
                    notify(BackEvent::Opened);
                }
                Flow::Continue
            }
            BackFrame::Array(array) => {
                if !self.opened {
                    notify(BackEvent::Failed(ProtocolViolation::FrameBeforeOpen("array").into()));
                    return Flow::Finished;
                }
                let expected = self.last_seq + 1;
                if array.sequence_id < expected {
                    trace!(seq = array.sequence_id, "dropping redelivered array");
                    return Flow::Continue;
                }
                if array.sequence_id > expected {
                    notify(BackEvent::Failed(
                        ProtocolViolation::OutOfOrder {
                            expected,
                            got: array.sequence_id,
                        }
                        .into(),
                    ));
                    return Flow::Finished;
                }
                self.last_seq = array.sequence_id;
                notify(BackEvent::Array(array));
                Flow::Continue
            }
            BackFrame::Noop => {
                trace!(session = %self.session, "keep-alive");
                Flow::Continue
            }
            BackFrame::Stop => {
                if !self.opened {
                    notify(BackEvent::Failed(ProtocolViolation::FrameBeforeOpen("stop").into()));
                } else {
                    notify(BackEvent::Stop);
                }
                Flow::Finished
            }
        }
    }
}
