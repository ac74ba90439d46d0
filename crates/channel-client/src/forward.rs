use std::{collections::VecDeque, sync::Arc};

use channel_proto::{Map, SessionId, SessionStatus};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{Backoff, ChannelConfig, ChannelError, ChannelTransport, TransportError};

pub(crate) enum ForwardEvent {
    Delivered { count: usize, status: SessionStatus },
    Failed(ChannelError),
}

struct OutgoingMap {
    map: Map,
    attempts: u32,
}

/// Drains queued maps onto the forward channel, one POST at a time.
///
/// A batch is removed from the queue only once the server acknowledged it.
/// Failed POSTs are retried with backoff; maps queued in the meantime join
/// the retried batch under the same offset.
pub(crate) struct ForwardSender {
    queue: mpsc::UnboundedSender<Map>,
    task: JoinHandle<()>,
}

impl ForwardSender {
    pub(crate) fn spawn<F>(
        transport: Arc<dyn ChannelTransport>,
        forward_path: String,
        session: SessionId,
        config: &ChannelConfig,
        notify: F,
    ) -> Self
    where
        F: Fn(ForwardEvent) + Send + Sync + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            transport,
            forward_path,
            session,
            max_batch: config.max_maps_per_post.max(1),
            max_attempts: config.forward_max_attempts.max(1),
            backoff: config.backoff(),
            rx,
            pending: VecDeque::new(),
            next_ofs: 0,
        };
        let task = tokio::spawn(worker.run(notify));
        Self { queue, task }
    }

    pub(crate) fn enqueue(&self, map: Map) -> bool {
        self.queue.send(map).is_ok()
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

struct Worker {
    transport: Arc<dyn ChannelTransport>,
    forward_path: String,
    session: SessionId,
    max_batch: usize,
    max_attempts: u32,
    backoff: Backoff,
    rx: mpsc::UnboundedReceiver<Map>,
    pending: VecDeque<OutgoingMap>,
    next_ofs: u64,
}

impl Worker {
    async fn run<F>(mut self, notify: F)
    where
        F: Fn(ForwardEvent) + Send + Sync + 'static,
    {
        loop {
            if self.pending.is_empty() {
                match self.rx.recv().await {
                    Some(map) => self.push(map),
                    None => return,
                }
            }
            while let Ok(map) = self.rx.try_recv() {
                self.push(map);
            }

            let count = self.pending.len().min(self.max_batch);
            let batch: Vec<Map> = self
                .pending
                .iter_mut()
                .take(count)
                .map(|outgoing| {
                    outgoing.attempts += 1;
                    outgoing.map.clone()
                })
                .collect();
            let attempts = self.pending.front().map_or(1, |outgoing| outgoing.attempts);

            match self
                .transport
                .post_maps(&self.forward_path, self.session, self.next_ofs, &batch)
                .await
            {
                Ok(status) => {
                    self.pending.drain(..count);
                    self.next_ofs += count as u64;
                    debug!(
                        session = %self.session,
                        count,
                        next_ofs = self.next_ofs,
                        outstanding = status.outstanding,
                        "forward batch acknowledged"
                    );
                    notify(ForwardEvent::Delivered { count, status });
                }
                Err(err) if attempts >= self.max_attempts => {
                    warn!(session = %self.session, attempts, error = %err, "giving up on forward channel");
                    notify(ForwardEvent::Failed(ChannelError::transport(attempts, err)));
                    return;
                }
                Err(TransportError::UnknownSession) => {
                    notify(ForwardEvent::Failed(ChannelError::transport(
                        attempts,
                        TransportError::UnknownSession,
                    )));
                    return;
                }
                Err(err) => {
                    let delay = self.backoff.delay(attempts);
                    warn!(
                        session = %self.session,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "forward post failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn push(&mut self, map: Map) {
        self.pending.push_back(OutgoingMap { map, attempts: 0 });
    }
}
