//! Scripted in-memory transport for exercising the client without a server.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use channel_proto::{
    encode_frames, BackChannelMode, BackFrame, ConnectRequest, ConnectResponse, ForwardBatch,
    InboundArray, Map, SessionId, SessionStatus, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{ByteStream, ChannelTransport};
use crate::TransportError;

type BodyTx = mpsc::UnboundedSender<Result<Bytes, TransportError>>;
type BodyRx = mpsc::UnboundedReceiver<Result<Bytes, TransportError>>;

/// Parameters of one `open_back_channel` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackRequest {
    pub since: Option<u64>,
    pub mode: BackChannelMode,
}

#[derive(Default)]
struct Script {
    handshake_error: Option<TransportError>,
    protocol_version: Option<u16>,
    post_failures: VecDeque<TransportError>,
    back_failures: VecDeque<TransportError>,
    back_bodies: VecDeque<BodyRx>,
    network_tests: VecDeque<BodyRx>,
    network_test_calls: usize,
    back_requests: Vec<BackRequest>,
    handshakes: Vec<ConnectRequest>,
    delivered: Vec<ForwardBatch>,
    post_attempts: usize,
    terminated: usize,
    post_delay: Option<Duration>,
}

/// Back channel responses are queued by the test with
/// [`MockTransport::queue_back_channel`]; each `open_back_channel` call takes
/// the oldest one, waiting until one is queued.
pub struct MockTransport {
    session: SessionId,
    script: Mutex<Script>,
    back_ready: Notify,
    posted_tx: mpsc::UnboundedSender<ForwardBatch>,
    posted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ForwardBatch>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (posted_tx, posted_rx) = mpsc::unbounded_channel();
        Self {
            session: SessionId::new_random(),
            script: Mutex::new(Script::default()),
            back_ready: Notify::new(),
            posted_tx,
            posted_rx: tokio::sync::Mutex::new(posted_rx),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn fail_handshake(&self, error: TransportError) {
        self.script.lock().handshake_error = Some(error);
    }

    /// Makes the handshake report another protocol version.
    pub fn answer_protocol_version(&self, version: u16) {
        self.script.lock().protocol_version = Some(version);
    }

    /// The next `errors.len()` POSTs fail with these errors, in order.
    pub fn fail_next_posts(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.script.lock().post_failures.extend(errors);
    }

    pub fn fail_next_back_opens(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.script.lock().back_failures.extend(errors);
    }

    pub fn set_post_delay(&self, delay: Duration) {
        self.script.lock().post_delay = Some(delay);
    }

    pub fn queue_back_channel(&self) -> MockBackChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().back_bodies.push_back(rx);
        self.back_ready.notify_one();
        MockBackChannel {
            session: self.session,
            tx,
        }
    }

    /// Scripts the body of the next network test. Without one queued the
    /// network test answers 404.
    pub fn queue_network_test(&self) -> MockBackChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().network_tests.push_back(rx);
        MockBackChannel {
            session: self.session,
            tx,
        }
    }

    pub fn network_test_calls(&self) -> usize {
        self.script.lock().network_test_calls
    }

    /// Waits for the next successfully delivered forward batch.
    pub async fn next_post(&self) -> Option<ForwardBatch> {
        self.posted_rx.lock().await.recv().await
    }

    pub fn delivered(&self) -> Vec<ForwardBatch> {
        self.script.lock().delivered.clone()
    }

    pub fn delivered_maps(&self) -> Vec<Map> {
        self.script
            .lock()
            .delivered
            .iter()
            .flat_map(|batch| batch.maps.iter().cloned())
            .collect()
    }

    pub fn post_attempts(&self) -> usize {
        self.script.lock().post_attempts
    }

    pub fn back_requests(&self) -> Vec<BackRequest> {
        self.script.lock().back_requests.clone()
    }

    pub fn handshakes(&self) -> Vec<ConnectRequest> {
        self.script.lock().handshakes.clone()
    }

    pub fn terminate_calls(&self) -> usize {
        self.script.lock().terminated
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelTransport for MockTransport {
    async fn handshake(
        &self,
        _forward_path: &str,
        request: &ConnectRequest,
    ) -> Result<ConnectResponse, TransportError> {
        let mut script = self.script.lock();
        script.handshakes.push(request.clone());
        if let Some(error) = script.handshake_error.clone() {
            return Err(error);
        }
        Ok(ConnectResponse {
            session_id: self.session,
            protocol_version: script.protocol_version.unwrap_or(PROTOCOL_VERSION),
        })
    }

    async fn post_maps(
        &self,
        _forward_path: &str,
        _session: SessionId,
        ofs: u64,
        maps: &[Map],
    ) -> Result<SessionStatus, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.script.lock().post_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = {
            let mut script = self.script.lock();
            script.post_attempts += 1;
            match script.post_failures.pop_front() {
                Some(error) => Err(error),
                None => {
                    let batch = ForwardBatch {
                        ofs,
                        maps: maps.to_vec(),
                    };
                    script.delivered.push(batch.clone());
                    let _ = self.posted_tx.send(batch);
                    Ok(SessionStatus {
                        back_channel: true,
                        last_array_seq: 0,
                        outstanding: 0,
                    })
                }
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn open_back_channel(
        &self,
        _back_path: &str,
        _session: SessionId,
        since: Option<u64>,
        mode: BackChannelMode,
    ) -> Result<ByteStream, TransportError> {
        {
            let mut script = self.script.lock();
            script.back_requests.push(BackRequest { since, mode });
            if let Some(error) = script.back_failures.pop_front() {
                return Err(error);
            }
        }
        loop {
            let body = self.script.lock().back_bodies.pop_front();
            if let Some(body) = body {
                return Ok(Box::pin(UnboundedReceiverStream::new(body)));
            }
            self.back_ready.notified().await;
        }
    }

    async fn terminate(&self, _forward_path: &str, _session: SessionId) -> Result<(), TransportError> {
        self.script.lock().terminated += 1;
        Ok(())
    }

    async fn network_test(&self, test_path: &str) -> Result<ByteStream, TransportError> {
        let mut script = self.script.lock();
        script.network_test_calls += 1;
        match script.network_tests.pop_front() {
            Some(body) => Ok(Box::pin(UnboundedReceiverStream::new(body))),
            None => Err(TransportError::Status {
                status: 404,
                message: format!("no network test at {test_path}"),
            }),
        }
    }
}

/// Server end of one scripted back channel response. Dropping it ends the
/// response body.
#[derive(Debug, Clone)]
pub struct MockBackChannel {
    session: SessionId,
    tx: BodyTx,
}

impl MockBackChannel {
    pub fn send_frames(&self, frames: &[BackFrame]) {
        if let Ok(chunk) = encode_frames(frames) {
            self.send_raw(chunk);
        }
    }

    pub fn send_open(&self) {
        self.send_frames(&[BackFrame::Open {
            session_id: self.session,
            version: PROTOCOL_VERSION,
        }]);
    }

    pub fn send_array(&self, seq: u64, payload: Vec<Value>) {
        self.send_frames(&[BackFrame::Array(InboundArray {
            sequence_id: seq,
            payload,
        })]);
    }

    pub fn send_stop(&self) {
        self.send_frames(&[BackFrame::Stop]);
    }

    pub fn send_raw(&self, bytes: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(bytes.into()));
    }

    /// Breaks the response body mid-stream.
    pub fn fail(&self, error: TransportError) {
        let _ = self.tx.send(Err(error));
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
