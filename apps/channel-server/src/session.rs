use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::Bytes;
use channel_proto::{
    array_chunk_len, encode_frame_chunks, BackChannelMode, BackFrame, ForwardBatch, InboundArray,
    Map, SessionId, SessionStatus, MAX_CHUNK_LEN, PROTOCOL_VERSION,
};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::queue::{MapQueue, MapQueueError};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// A `noop` is written when an attached back channel was idle this long.
    pub heartbeat_interval: Duration,
    /// Back channels older than this are dropped so the client reconnects.
    pub back_channel_max_age: Duration,
    /// Arrays written without being acknowledged for this long drop the
    /// back channel.
    pub ack_timeout: Duration,
    /// Sessions without a back channel for this long are reclaimed.
    pub reopen_window: Duration,
    pub sweep_interval: Duration,
    pub max_parked_maps: usize,
    /// Streaming back channels are recycled past this many bytes.
    pub max_stream_bytes: usize,
    /// ... or when more unacknowledged arrays than this are buffered.
    pub max_buffered_arrays: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            back_channel_max_age: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(60),
            reopen_window: Duration::from_secs(20),
            sweep_interval: Duration::from_secs(1),
            max_parked_maps: 100,
            max_stream_bytes: 10 * 1024,
            max_buffered_arrays: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Handshake done, no `open` frame written yet.
    Init,
    Ready,
    /// `stop` is queued; the session ends once it is flushed.
    WriteClosed,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session {0} is closed")]
    Closed(SessionId),
    #[error("rejected map batch: {0}")]
    BadMap(#[from] MapQueueError),
    #[error("array of {len} bytes does not fit in a {limit} byte back channel chunk")]
    ArrayTooLarge { len: usize, limit: usize },
}

/// Application end of a session: maps posted by the client come out of
/// [`ServerChannel::next_map`], arrays go back with
/// [`ServerChannel::send_array`].
pub struct ServerChannel {
    session_id: SessionId,
    client_version: String,
    maps: mpsc::UnboundedReceiver<Map>,
    registry: SessionRegistry,
}

impl ServerChannel {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    /// Next map from the client, in forward-channel order. `None` once the
    /// session is gone.
    pub async fn next_map(&mut self) -> Option<Map> {
        self.maps.recv().await
    }

    pub async fn send_array(&self, payload: Vec<Value>) -> Result<u64, SessionError> {
        self.registry.send_array(self.session_id, payload).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.registry.close(self.session_id).await
    }
}

impl std::fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerChannel")
            .field("session_id", &self.session_id)
            .field("client_version", &self.client_version)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub client_version: String,
    pub state: ServerState,
    pub back_channel: bool,
    pub last_array_seq: u64,
    pub outstanding: usize,
    pub next_map_ofs: u64,
    pub idle_secs: u64,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    sessions: DashMap<SessionId, Arc<Session>>,
    config: SessionConfig,
    accept_tx: mpsc::UnboundedSender<ServerChannel>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<ServerChannel>>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SessionRegistryInner {
                sessions: DashMap::new(),
                config,
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Creates a session and hands its application end to the caller.
    pub fn open(&self, client_version: impl Into<String>) -> (SessionId, ServerChannel) {
        let client_version = client_version.into();
        let session_id = SessionId::new_random();
        let (maps_tx, maps_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(
            session_id,
            client_version.clone(),
            maps_tx,
            &self.inner.config,
        ));
        self.inner.sessions.insert(session_id, session);

        counter!("channel_server_sessions_opened_total", 1);
        gauge!("channel_server_sessions_active", self.len() as f64);
        info!(%session_id, %client_version, "session opened");

        let channel = ServerChannel {
            session_id,
            client_version,
            maps: maps_rx,
            registry: self.clone(),
        };
        (session_id, channel)
    }

    /// Opens a session on behalf of a handshake; the application picks it up
    /// through [`SessionRegistry::accept`].
    pub fn handshake(&self, client_version: impl Into<String>) -> SessionId {
        let (session_id, channel) = self.open(client_version);
        if self.inner.accept_tx.send(channel).is_err() {
            warn!(%session_id, "no application is accepting sessions");
        }
        session_id
    }

    /// Next session opened through a handshake.
    pub async fn accept(&self) -> Option<ServerChannel> {
        self.inner.accept_rx.lock().await.recv().await
    }

    pub async fn post(
        &self,
        session_id: SessionId,
        batch: ForwardBatch,
    ) -> Result<SessionStatus, SessionError> {
        let session = self.get(session_id)?;
        let mut inner = session.inner.lock().await;
        if inner.state == ServerState::Closed {
            return Err(SessionError::Closed(session_id));
        }
        inner.last_activity = Instant::now();

        let received = batch.maps.len();
        let ready = inner.maps.push(batch.ofs, batch.maps).map_err(|err| {
            warn!(%session_id, ofs = batch.ofs, error = %err, "rejecting map batch");
            counter!("channel_server_bad_map_batches_total", 1);
            SessionError::from(err)
        })?;

        let delivered = ready.len();
        if let Some(maps_tx) = &inner.maps_tx {
            for map in ready {
                if maps_tx.send(map).is_err() {
                    debug!(%session_id, "application dropped its map stream");
                    break;
                }
            }
        }
        counter!("channel_server_maps_received_total", delivered as u64);
        debug!(%session_id, ofs = batch.ofs, received, delivered, "forward batch accepted");
        Ok(inner.status())
    }

    pub async fn attach_back_channel(
        &self,
        session_id: SessionId,
        since: Option<u64>,
        mode: BackChannelMode,
    ) -> Result<mpsc::UnboundedReceiver<Bytes>, SessionError> {
        let session = self.get(session_id)?;
        let mut inner = session.inner.lock().await;
        if inner.state == ServerState::Closed {
            return Err(SessionError::Closed(session_id));
        }
        let now = Instant::now();
        inner.last_activity = now;

        if let Some(since) = since {
            inner.acknowledge(since);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if inner.back.is_some() {
            debug!(%session_id, "replacing back channel");
        }
        inner.back = Some(BackChannel {
            tx,
            mode,
            attached_at: now,
            last_write: now,
            bytes_written: 0,
            written_through: inner.acked_seq,
        });
        inner.detached_since = None;
        counter!("channel_server_back_channels_total", 1, "mode" => mode.as_str());

        let lead = if since.is_none() {
            Some(BackFrame::Open {
                session_id,
                version: PROTOCOL_VERSION,
            })
        } else {
            None
        };
        let flushed = inner.flush(lead, &self.inner.config, now);
        drop(inner);
        self.after_flush(&session, flushed);
        Ok(rx)
    }

    pub async fn send_array(
        &self,
        session_id: SessionId,
        payload: Vec<Value>,
    ) -> Result<u64, SessionError> {
        let session = self.get(session_id)?;
        let mut inner = session.inner.lock().await;
        if matches!(inner.state, ServerState::WriteClosed | ServerState::Closed) {
            return Err(SessionError::Closed(session_id));
        }
        let array = InboundArray {
            sequence_id: inner.next_seq,
            payload,
        };
        let len = array_chunk_len(&array).unwrap_or(usize::MAX);
        if len > MAX_CHUNK_LEN {
            warn!(%session_id, len, "refusing array larger than a back channel chunk");
            return Err(SessionError::ArrayTooLarge {
                len,
                limit: MAX_CHUNK_LEN,
            });
        }
        let sequence_id = array.sequence_id;
        inner.next_seq += 1;
        inner.outgoing.push_back(array);
        counter!("channel_server_arrays_sent_total", 1);

        let flushed = inner.flush(None, &self.inner.config, Instant::now());
        drop(inner);
        self.after_flush(&session, flushed);
        Ok(sequence_id)
    }

    /// Queues `stop`; the session ends once it reaches the client.
    pub async fn close(&self, session_id: SessionId) -> Result<(), SessionError> {
        let session = self.get(session_id)?;
        let mut inner = session.inner.lock().await;
        match inner.state {
            ServerState::Closed => return Err(SessionError::Closed(session_id)),
            ServerState::WriteClosed => return Ok(()),
            ServerState::Init | ServerState::Ready => inner.state = ServerState::WriteClosed,
        }
        info!(%session_id, "closing session");
        let flushed = inner.flush(None, &self.inner.config, Instant::now());
        drop(inner);
        self.after_flush(&session, flushed);
        Ok(())
    }

    /// Client-requested teardown.
    pub async fn terminate(&self, session_id: SessionId) -> Result<(), SessionError> {
        let session = self.get(session_id)?;
        session.inner.lock().await.shut_down();
        self.remove(&session, "terminated");
        Ok(())
    }

    pub async fn status(&self, session_id: SessionId) -> Result<SessionStatus, SessionError> {
        let session = self.get(session_id)?;
        let inner = session.inner.lock().await;
        Ok(inner.status())
    }

    /// Runs heartbeats, expiry and reclamation once. Returns the number of
    /// sessions reclaimed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let config = &self.inner.config;
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut reclaimed = 0;
        for session in sessions {
            let mut inner = session.inner.lock().await;
            let session_id = session.id;

            if let Some(back) = &inner.back {
                let expired = now.duration_since(back.attached_at) >= config.back_channel_max_age;
                let unacked = inner
                    .unacked_since
                    .is_some_and(|since| now.duration_since(since) >= config.ack_timeout);
                let idle = now.duration_since(back.last_write) >= config.heartbeat_interval;
                if expired || unacked {
                    debug!(%session_id, expired, unacked, "dropping back channel");
                    inner.detach(now);
                } else if idle {
                    let flushed = inner.flush(Some(BackFrame::Noop), config, now);
                    drop(inner);
                    self.after_flush(&session, flushed);
                    continue;
                }
            }

            let abandoned = inner
                .detached_since
                .is_some_and(|since| now.duration_since(since) >= config.reopen_window);
            if abandoned {
                inner.shut_down();
                drop(inner);
                self.remove(&session, "reclaimed");
                counter!("channel_server_sessions_reclaimed_total", 1);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let reclaimed = registry.sweep().await;
                if reclaimed > 0 {
                    info!(reclaimed, "reclaimed abandoned sessions");
                }
            }
        })
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let now = Instant::now();
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            let inner = session.inner.lock().await;
            let status = inner.status();
            snapshots.push(SessionSnapshot {
                session_id: session.id.to_string(),
                client_version: session.client_version.clone(),
                state: inner.state,
                back_channel: status.back_channel,
                last_array_seq: status.last_array_seq,
                outstanding: status.outstanding,
                next_map_ofs: inner.maps.next_ofs(),
                idle_secs: now.duration_since(inner.last_activity).as_secs(),
            });
        }
        snapshots
    }

    fn get(&self, session_id: SessionId) -> Result<Arc<Session>, SessionError> {
        self.inner
            .sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::UnknownSession(session_id))
    }

    fn after_flush(&self, session: &Arc<Session>, flushed: Flushed) {
        if flushed.stop_written {
            self.remove(session, "closed");
        }
    }

    fn remove(&self, session: &Arc<Session>, reason: &'static str) {
        if self
            .inner
            .sessions
            .remove_if(&session.id, |_, existing| Arc::ptr_eq(existing, session))
            .is_some()
        {
            gauge!("channel_server_sessions_active", self.len() as f64);
            info!(session_id = %session.id, reason, "session removed");
        }
    }
}

struct Session {
    id: SessionId,
    client_version: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(
        id: SessionId,
        client_version: String,
        maps_tx: mpsc::UnboundedSender<Map>,
        config: &SessionConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            client_version,
            inner: Mutex::new(SessionInner {
                id,
                state: ServerState::Init,
                maps: MapQueue::new(config.max_parked_maps),
                maps_tx: Some(maps_tx),
                outgoing: VecDeque::new(),
                next_seq: 1,
                acked_seq: 0,
                unacked_since: None,
                back: None,
                last_activity: now,
                detached_since: Some(now),
            }),
        }
    }
}

struct BackChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    mode: BackChannelMode,
    attached_at: Instant,
    last_write: Instant,
    bytes_written: usize,
    /// Highest sequence id already written on this response.
    written_through: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flushed {
    stop_written: bool,
}

struct SessionInner {
    id: SessionId,
    state: ServerState,
    maps: MapQueue,
    maps_tx: Option<mpsc::UnboundedSender<Map>>,
    /// Arrays sent but not yet acknowledged by a `since` parameter.
    outgoing: VecDeque<InboundArray>,
    next_seq: u64,
    acked_seq: u64,
    unacked_since: Option<Instant>,
    back: Option<BackChannel>,
    last_activity: Instant,
    detached_since: Option<Instant>,
}

impl SessionInner {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            back_channel: self.back.is_some(),
            last_array_seq: self.next_seq - 1,
            outstanding: self.outgoing.len(),
        }
    }

    fn acknowledge(&mut self, since: u64) {
        let since = since.min(self.next_seq - 1);
        // Every ack restarts the clock; the next flush of arrays sets it again.
        self.unacked_since = None;
        if since <= self.acked_seq {
            return;
        }
        self.acked_seq = since;
        while self
            .outgoing
            .front()
            .is_some_and(|array| array.sequence_id <= since)
        {
            self.outgoing.pop_front();
        }
    }

    fn detach(&mut self, now: Instant) {
        self.unacked_since = None;
        if self.back.take().is_some() {
            self.detached_since = Some(now);
        }
    }

    fn shut_down(&mut self) {
        self.state = ServerState::Closed;
        self.back = None;
        self.maps_tx = None;
        self.detached_since = None;
    }

    /// Writes `lead`, every array not yet written on the current back
    /// channel and a pending `stop`, in as many chunks as the size limit
    /// needs, then applies the recycling rules.
    fn flush(&mut self, lead: Option<BackFrame>, config: &SessionConfig, now: Instant) -> Flushed {
        let Some(back) = self.back.as_mut() else {
            return Flushed::default();
        };

        let mut frames: Vec<BackFrame> = lead.into_iter().collect();
        let mut written_through = back.written_through;
        for array in self
            .outgoing
            .iter()
            .filter(|array| array.sequence_id > back.written_through)
        {
            frames.push(BackFrame::Array(array.clone()));
            written_through = array.sequence_id;
        }
        let stop = self.state == ServerState::WriteClosed;
        if stop {
            frames.push(BackFrame::Stop);
        }
        if frames.is_empty() {
            return Flushed::default();
        }

        let chunks = match encode_frame_chunks(&frames) {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "failed to encode back channel chunk");
                self.detach(now);
                return Flushed::default();
            }
        };
        let mut len = 0;
        for chunk in chunks {
            len += chunk.len();
            histogram!("channel_server_back_chunk_bytes", chunk.len() as f64);
            if back.tx.send(chunk).is_err() {
                debug!(session_id = %self.id, "back channel reader went away");
                self.detach(now);
                return Flushed::default();
            }
        }

        let wrote_arrays = written_through > back.written_through;
        back.written_through = written_through;
        back.bytes_written += len;
        back.last_write = now;
        if self.state == ServerState::Init {
            self.state = ServerState::Ready;
        }
        if wrote_arrays {
            self.unacked_since = Some(now);
        }

        if stop {
            self.shut_down();
            return Flushed { stop_written: true };
        }

        let recycle = match back.mode {
            BackChannelMode::Poll => true,
            BackChannelMode::Stream => {
                back.bytes_written > config.max_stream_bytes
                    || self.outgoing.len() > config.max_buffered_arrays
            }
        };
        if recycle {
            debug!(session_id = %self.id, bytes = back.bytes_written, "ending back channel response");
            self.detach(now);
        }
        Flushed::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel_proto::decode_arrays;
    use serde_json::json;

    fn collect(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<u8> {
        let mut body = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            body.extend_from_slice(&chunk);
        }
        body
    }

    fn frames(body: &[u8]) -> Vec<BackFrame> {
        let mut decoder = channel_proto::ChunkDecoder::new();
        decoder.push(body);
        let mut frames = Vec::new();
        while let Some(chunk) = decoder.next_chunk().expect("well-formed") {
            frames.extend(chunk);
        }
        frames
    }

    fn batch(ofs: u64, ids: &[&str]) -> ForwardBatch {
        ForwardBatch {
            ofs,
            maps: ids
                .iter()
                .map(|id| Map::new().with("id", *id).expect("scalar"))
                .collect(),
        }
    }

    #[tokio::test]
    async fn first_attach_writes_open_then_arrays() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, channel) = registry.open("cv1");
        channel.send_array(vec![json!(1)]).await.expect("send");

        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        let frames = frames(&collect(&mut rx));
        assert_eq!(
            frames[0],
            BackFrame::Open {
                session_id: sid,
                version: PROTOCOL_VERSION
            }
        );
        assert!(matches!(&frames[1], BackFrame::Array(a) if a.sequence_id == 1));

        channel.send_array(vec![json!(2)]).await.expect("send");
        let arrays = decode_arrays(&collect(&mut rx)).expect("decode");
        assert_eq!(arrays.len(), 1);
        assert_eq!(arrays[0].sequence_id, 2);
    }

    #[tokio::test]
    async fn reconnect_resends_only_unacknowledged_arrays() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, channel) = registry.open("cv1");
        let _first = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        for i in 1..=3 {
            channel.send_array(vec![json!(i)]).await.expect("send");
        }

        let mut rx = registry
            .attach_back_channel(sid, Some(1), BackChannelMode::Stream)
            .await
            .expect("reattach");
        let seqs: Vec<u64> = decode_arrays(&collect(&mut rx))
            .expect("decode")
            .iter()
            .map(|a| a.sequence_id)
            .collect();
        assert_eq!(seqs, [2, 3]);
        assert_eq!(registry.status(sid).await.expect("status").outstanding, 2);
    }

    #[tokio::test]
    async fn replaced_back_channel_is_ended() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, _channel) = registry.open("cv1");
        let mut first = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        let _second = registry
            .attach_back_channel(sid, Some(0), BackChannelMode::Stream)
            .await
            .expect("attach");
        collect(&mut first);
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn poll_back_channel_ends_after_one_flush() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, channel) = registry.open("cv1");
        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Poll)
            .await
            .expect("attach");
        assert_eq!(frames(&collect(&mut rx)).len(), 1);
        assert!(rx.recv().await.is_none());
        assert!(!registry.status(sid).await.expect("status").back_channel);

        channel.send_array(vec![json!("queued")]).await.expect("send");
        let mut rx = registry
            .attach_back_channel(sid, Some(0), BackChannelMode::Poll)
            .await
            .expect("attach");
        let arrays = decode_arrays(&collect(&mut rx)).expect("decode");
        assert_eq!(arrays[0].payload, vec![json!("queued")]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn streaming_back_channel_is_recycled_past_the_array_limit() {
        let config = SessionConfig {
            max_buffered_arrays: 3,
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::new(config);
        let (sid, channel) = registry.open("cv1");
        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        for i in 0..4 {
            channel.send_array(vec![json!(i)]).await.expect("send");
        }
        let body = collect(&mut rx);
        assert_eq!(frames(&body).len(), 5);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn posted_maps_reach_the_application_in_order() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, mut channel) = registry.open("cv1");

        registry.post(sid, batch(1, &["b", "c"])).await.expect("post");
        let status = registry.post(sid, batch(0, &["a", "b"])).await.expect("post");
        assert_eq!(status.last_array_seq, 0);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let map = channel.next_map().await.expect("map");
            seen.push(map.get_str("id").expect("id").to_string());
        }
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn close_writes_stop_and_forgets_the_session() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, mut channel) = registry.open("cv1");
        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        channel.close().await.expect("close");

        let frames = frames(&collect(&mut rx));
        assert_eq!(frames.last(), Some(&BackFrame::Stop));
        assert!(rx.recv().await.is_none());
        assert!(channel.next_map().await.is_none());
        assert_eq!(
            registry.post(sid, batch(0, &["late"])).await,
            Err(SessionError::UnknownSession(sid))
        );
    }

    #[tokio::test]
    async fn close_without_back_channel_waits_for_reconnect() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, channel) = registry.open("cv1");
        channel.close().await.expect("close");
        assert_eq!(
            channel.send_array(vec![]).await,
            Err(SessionError::Closed(sid))
        );

        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        let frames = frames(&collect(&mut rx));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], BackFrame::Stop);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn terminate_removes_the_session() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, mut channel) = registry.open("cv1");
        registry.terminate(sid).await.expect("terminate");
        assert!(channel.next_map().await.is_none());
        assert_eq!(
            registry.terminate(sid).await,
            Err(SessionError::UnknownSession(sid))
        );
    }

    #[tokio::test]
    async fn handshake_sessions_are_accepted() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let sid = registry.handshake("cv9");
        let channel = registry.accept().await.expect("accepted");
        assert_eq!(channel.session_id(), sid);
        assert_eq!(channel.client_version(), "cv9");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_back_channel_gets_heartbeats() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, _channel) = registry.open("cv1");
        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        collect(&mut rx);

        tokio::time::advance(Duration::from_secs(31)).await;
        registry.sweep().await;
        assert_eq!(frames(&collect(&mut rx)), vec![BackFrame::Noop]);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_back_channel_is_dropped() {
        let config = SessionConfig {
            heartbeat_interval: Duration::from_secs(600),
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::new(config);
        let (sid, channel) = registry.open("cv1");
        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        channel.send_array(vec![json!(1)]).await.expect("send");
        collect(&mut rx);

        tokio::time::advance(Duration::from_secs(61)).await;
        registry.sweep().await;
        assert!(rx.recv().await.is_none());
        assert!(!registry.status(sid).await.expect("status").back_channel);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timer_restarts_on_reattach() {
        let config = SessionConfig {
            heartbeat_interval: Duration::from_secs(600),
            back_channel_max_age: Duration::from_secs(600),
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::new(config);
        let (sid, channel) = registry.open("cv1");
        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        channel.send_array(vec![json!(1)]).await.expect("send");
        tokio::time::advance(Duration::from_secs(61)).await;
        registry.sweep().await;
        assert!(rx.recv().await.is_some());
        collect(&mut rx);
        assert!(rx.recv().await.is_none());

        channel.send_array(vec![json!(2)]).await.expect("send");
        let mut rx = registry
            .attach_back_channel(sid, Some(1), BackChannelMode::Stream)
            .await
            .expect("reattach");
        let seqs: Vec<u64> = decode_arrays(&collect(&mut rx))
            .expect("decode")
            .iter()
            .map(|a| a.sequence_id)
            .collect();
        assert_eq!(seqs, [2]);

        tokio::time::advance(Duration::from_secs(1)).await;
        registry.sweep().await;
        assert!(registry.status(sid).await.expect("status").back_channel);

        tokio::time::advance(Duration::from_secs(30)).await;
        channel.send_array(vec![json!(3)]).await.expect("send");
        tokio::time::advance(Duration::from_secs(45)).await;
        registry.sweep().await;
        assert!(registry.status(sid).await.expect("status").back_channel);

        tokio::time::advance(Duration::from_secs(16)).await;
        registry.sweep().await;
        assert!(!registry.status(sid).await.expect("status").back_channel);
    }

    #[tokio::test]
    async fn large_backlog_is_written_in_several_chunks() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, channel) = registry.open("cv1");
        let payload = json!("z".repeat(1024));
        for _ in 0..1100 {
            channel.send_array(vec![payload.clone()]).await.expect("send");
        }

        let mut rx = registry
            .attach_back_channel(sid, None, BackChannelMode::Stream)
            .await
            .expect("attach");
        let mut chunks = 0;
        let mut body = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks += 1;
            body.extend_from_slice(&chunk);
        }
        assert!(chunks > 1);
        let frames = frames(&body);
        assert!(matches!(frames[0], BackFrame::Open { .. }));
        let seqs: Vec<u64> = frames[1..]
            .iter()
            .map(|frame| match frame {
                BackFrame::Array(array) => array.sequence_id,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(seqs, (1..=1100).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn arrays_larger_than_a_chunk_are_refused() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, channel) = registry.open("cv1");
        let huge = json!("h".repeat(MAX_CHUNK_LEN));
        assert!(matches!(
            channel.send_array(vec![huge]).await,
            Err(SessionError::ArrayTooLarge { limit: MAX_CHUNK_LEN, .. })
        ));
        assert_eq!(channel.send_array(vec![json!(1)]).await, Ok(1));
        assert_eq!(registry.status(sid).await.expect("status").outstanding, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_sessions_are_reclaimed() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (sid, mut channel) = registry.open("cv1");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registry.sweep().await, 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(registry.sweep().await, 1);

        assert!(channel.next_map().await.is_none());
        assert!(matches!(
            registry
                .attach_back_channel(sid, Some(0), BackChannelMode::Stream)
                .await,
            Err(SessionError::UnknownSession(_))
        ));
    }
}
