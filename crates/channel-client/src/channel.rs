use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use channel_proto::{
    BackChannelMode, ConnectRequest, ConnectResponse, Map, SessionId, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    back::{BackEvent, BackReceiver},
    forward::{ForwardEvent, ForwardSender},
    network_test::detect_back_channel_mode,
    ChannelConfig, ChannelError, ChannelHandler, ChannelState, ChannelTransport, HttpTransport,
    ProtocolViolation, Timer, TimerHandle, TimerId, TransportError, UsageError,
};

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    SendMap(Map),
    Disconnect,
}

struct Connected {
    response: ConnectResponse,
    mode: BackChannelMode,
}

enum Event {
    Command(Command),
    Handshake(Result<Connected, TransportError>),
    HandshakeTimeout,
    Back(BackEvent),
    Forward(ForwardEvent),
    Timer(TimerId),
    /// Every [`Channel`] handle is gone.
    Released,
}

struct Pending {
    handler: Box<dyn ChannelHandler>,
    transport: Arc<dyn ChannelTransport>,
    events: mpsc::UnboundedReceiver<Event>,
}

/// State the driver keeps even after the last handle is dropped.
struct Core {
    config: ChannelConfig,
    state: watch::Sender<ChannelState>,
    session: Mutex<Option<SessionId>>,
    mode: Mutex<Option<BackChannelMode>>,
}

struct Shared {
    core: Arc<Core>,
    events: mpsc::UnboundedSender<Event>,
    pending: Mutex<Option<Pending>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Released);
    }
}

/// Handle to one client channel. Cheap to clone; all clones drive the same
/// session. Dropping the last clone stops the channel without any callback.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state())
            .field("session", &self.session_id())
            .finish()
    }
}

impl Channel {
    /// Binds `handler` to a new channel in the `Init` state. Nothing touches
    /// the network until [`Channel::connect`].
    pub fn new<H>(config: ChannelConfig, transport: Arc<dyn ChannelTransport>, handler: H) -> Self
    where
        H: ChannelHandler,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Init);
        Self {
            shared: Arc::new(Shared {
                core: Arc::new(Core {
                    config,
                    state,
                    session: Mutex::new(None),
                    mode: Mutex::new(None),
                }),
                events: events_tx,
                pending: Mutex::new(Some(Pending {
                    handler: Box::new(handler),
                    transport,
                    events: events_rx,
                })),
            }),
        }
    }

    /// Channel speaking HTTP to `config.base_url`.
    pub fn over_http<H>(config: ChannelConfig, handler: H) -> Result<Self, TransportError>
    where
        H: ChannelHandler,
    {
        let transport = HttpTransport::new(&config.base_url)?;
        Ok(Self::new(config, Arc::new(transport), handler))
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.core.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.shared.core.state.subscribe()
    }

    /// Session id assigned by the server, once the handshake succeeded.
    pub fn session_id(&self) -> Option<SessionId> {
        *self.shared.core.session.lock()
    }

    /// Mode the back channel runs in, once the handshake succeeded.
    pub fn back_channel_mode(&self) -> Option<BackChannelMode> {
        *self.shared.core.mode.lock()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.core.config
    }

    /// Resolves with the terminal state (`Closed` or `Error`) once reached.
    pub async fn closed(&self) -> ChannelState {
        let mut state = self.subscribe();
        let terminal = match state.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        terminal
    }

    /// Starts the handshake on `forward_path`; the back channel is opened on
    /// `back_path`. Must be called from within a Tokio runtime.
    pub fn connect(
        &self,
        forward_path: impl Into<String>,
        back_path: impl Into<String>,
    ) -> Result<(), UsageError> {
        let Some(pending) = self.shared.pending.lock().take() else {
            return Err(UsageError::AlreadyConnected);
        };
        self.shared.core.state.send_replace(ChannelState::Connecting);

        let driver = Driver {
            core: Arc::clone(&self.shared.core),
            channel: Arc::downgrade(&self.shared),
            events_tx: self.shared.events.clone(),
            handler: pending.handler,
            transport: pending.transport,
            events: pending.events,
            forward_path: forward_path.into(),
            back_path: back_path.into(),
            session: None,
            forward: None,
            back: None,
            handshake: None,
            handshake_deadline: None,
            bad_chunks: 0,
            close_when_open: false,
        };
        info!(forward = %driver.forward_path, back = %driver.back_path, "connecting channel");
        tokio::spawn(driver.run());
        Ok(())
    }

    /// Queues a map for the forward channel. Only allowed while `Open`.
    pub fn send_map(&self, map: Map) -> Result<(), UsageError> {
        if self.state() != ChannelState::Open {
            return Err(UsageError::NotOpen);
        }
        self.shared
            .events
            .send(Event::Command(Command::SendMap(map)))
            .map_err(|_| UsageError::Stopped)
    }

    /// Closes the channel and notifies the server. A channel that never
    /// connected closes immediately; a connecting one closes as soon as it
    /// opens. No-op once terminal.
    pub fn disconnect(&self) {
        let pending = self.shared.pending.lock().take();
        if let Some(mut pending) = pending {
            self.shared.core.state.send_replace(ChannelState::Closed);
            info!("channel closed before connecting");
            pending.handler.on_closed(self);
            return;
        }
        if self.state().is_terminal() {
            return;
        }
        let _ = self.shared.events.send(Event::Command(Command::Disconnect));
    }

    /// Starts a timer whose firings reach `ChannelHandler::on_timer` with
    /// `id`. Must be called from within a Tokio runtime.
    pub fn start_timer(&self, id: TimerId, delay: Duration, repeat: bool) -> TimerHandle {
        let events = self.shared.events.clone();
        let timer = Timer::start(delay, repeat, move || {
            let _ = events.send(Event::Timer(id));
        });
        TimerHandle::new(id, timer)
    }
}

/// Owns the handler and every task of a connected channel. All state
/// transitions happen here.
struct Driver {
    core: Arc<Core>,
    channel: Weak<Shared>,
    events_tx: mpsc::UnboundedSender<Event>,
    handler: Box<dyn ChannelHandler>,
    transport: Arc<dyn ChannelTransport>,
    events: mpsc::UnboundedReceiver<Event>,
    forward_path: String,
    back_path: String,
    session: Option<SessionId>,
    forward: Option<ForwardSender>,
    back: Option<BackReceiver>,
    handshake: Option<JoinHandle<()>>,
    handshake_deadline: Option<JoinHandle<()>>,
    bad_chunks: u32,
    close_when_open: bool,
}

impl Driver {
    async fn run(mut self) {
        self.start_handshake();
        while let Some(event) = self.events.recv().await {
            let Some(shared) = self.channel.upgrade() else {
                self.release().await;
                break;
            };
            let channel = Channel { shared };
            self.handle(event, &channel).await;
            if self.state().is_terminal() {
                break;
            }
        }
        self.teardown();
        debug!(session = ?self.session, "channel driver stopped");
    }

    fn state(&self) -> ChannelState {
        *self.core.state.borrow()
    }

    fn start_handshake(&mut self) {
        let config = &self.core.config;
        let request = ConnectRequest::new(config.client_version.clone(), config.base_url.clone());
        let network_test = config
            .network_test_path
            .clone()
            .map(|path| (path, config.network_test_timeout));
        let default_mode = config.back_channel_mode;
        let transport = self.transport.clone();
        let forward_path = self.forward_path.clone();
        let events = self.events_tx.clone();
        self.handshake = Some(tokio::spawn(async move {
            let mode = match network_test {
                Some((path, timeout)) => {
                    match detect_back_channel_mode(transport.as_ref(), &path, timeout).await {
                        Ok(mode) => mode,
                        Err(err) => {
                            let _ = events.send(Event::Handshake(Err(err)));
                            return;
                        }
                    }
                }
                None => default_mode,
            };
            let result = transport
                .handshake(&forward_path, &request)
                .await
                .map(|response| Connected { response, mode });
            let _ = events.send(Event::Handshake(result));
        }));

        let timeout = config.handshake_timeout;
        let events = self.events_tx.clone();
        self.handshake_deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::HandshakeTimeout);
        }));
    }

    async fn handle(&mut self, event: Event, channel: &Channel) {
        let state = self.state();
        match event {
            Event::Handshake(Ok(connected)) => self.handshake_complete(connected, channel),
            Event::Handshake(Err(err)) => {
                self.fail(ChannelError::transport(1, err), channel);
            }
            Event::HandshakeTimeout => {
                if state == ChannelState::Connecting {
                    self.fail(ChannelError::Timeout("channel open"), channel);
                }
            }
            Event::Back(BackEvent::Opened) => {
                if state != ChannelState::Connecting {
                    return;
                }
                if let Some(deadline) = self.handshake_deadline.take() {
                    deadline.abort();
                }
                self.transition(ChannelState::Open);
                info!(session = ?self.session, "channel open");
                if self.close_when_open {
                    self.close(true, channel).await;
                } else {
                    self.handler.on_open(channel);
                }
            }
            Event::Back(BackEvent::Array(array)) => {
                if state == ChannelState::Open {
                    self.handler.on_array(channel, &array);
                }
            }
            Event::Back(BackEvent::Stop) => {
                info!(session = ?self.session, "server stopped the channel");
                self.close(false, channel).await;
            }
            Event::Back(BackEvent::BadChunk { raw, error }) => {
                self.bad_chunks += 1;
                self.handler.on_bad_map(channel, &raw);
                let limit = self.core.config.max_bad_frames;
                if self.bad_chunks >= limit && !self.state().is_terminal() {
                    self.fail(ChannelError::BadFormat(error), channel);
                }
            }
            Event::Back(BackEvent::Failed(err)) | Event::Forward(ForwardEvent::Failed(err)) => {
                self.fail(err, channel);
            }
            Event::Forward(ForwardEvent::Delivered { count, status }) => {
                debug!(
                    count,
                    back_channel = status.back_channel,
                    last_array_seq = status.last_array_seq,
                    "maps delivered"
                );
            }
            Event::Command(Command::SendMap(map)) => match &self.forward {
                Some(forward) if state == ChannelState::Open => {
                    forward.enqueue(map);
                }
                _ => debug!(%state, "dropping map queued after the channel left open"),
            },
            Event::Command(Command::Disconnect) => match state {
                ChannelState::Connecting => self.close_when_open = true,
                ChannelState::Open => self.close(true, channel).await,
                _ => {}
            },
            Event::Timer(id) => {
                if !state.is_terminal() {
                    self.handler.on_timer(channel, id);
                }
            }
            // A handle was alive again by the time this was read.
            Event::Released => {}
        }
    }

    fn handshake_complete(&mut self, connected: Connected, channel: &Channel) {
        let Connected { response, mode } = connected;
        if response.protocol_version != PROTOCOL_VERSION {
            self.fail(
                ProtocolViolation::UnsupportedVersion(response.protocol_version).into(),
                channel,
            );
            return;
        }
        let session = response.session_id;
        debug!(%session, mode = mode.as_str(), "handshake complete");
        self.session = Some(session);
        *self.core.session.lock() = Some(session);
        *self.core.mode.lock() = Some(mode);

        let config = ChannelConfig {
            back_channel_mode: mode,
            ..self.core.config.clone()
        };
        let events = self.events_tx.clone();
        self.back = Some(BackReceiver::spawn(
            self.transport.clone(),
            self.back_path.clone(),
            session,
            &config,
            move |event| {
                let _ = events.send(Event::Back(event));
            },
        ));
        let events = self.events_tx.clone();
        self.forward = Some(ForwardSender::spawn(
            self.transport.clone(),
            self.forward_path.clone(),
            session,
            &config,
            move |event| {
                let _ = events.send(Event::Forward(event));
            },
        ));
    }

    /// Graceful shutdown: `Closing`, best-effort terminate, `Closed`.
    async fn close(&mut self, notify_server: bool, channel: &Channel) {
        if !self.transition(ChannelState::Closing) {
            return;
        }
        self.teardown();
        if notify_server {
            self.terminate().await;
        }
        self.transition(ChannelState::Closed);
        info!(session = ?self.session, "channel closed");
        self.handler.on_closed(channel);
    }

    /// The application let go of the channel: stop every task and tell the
    /// server, without callbacks.
    async fn release(&mut self) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        info!(session = ?self.session, %state, "every channel handle dropped; closing");
        self.teardown();
        self.terminate().await;
        self.core.state.send_replace(ChannelState::Closed);
    }

    async fn terminate(&mut self) {
        let Some(session) = self.session else {
            return;
        };
        let terminate = self.transport.terminate(&self.forward_path, session);
        match tokio::time::timeout(TERMINATE_TIMEOUT, terminate).await {
            Ok(Ok(())) => debug!(%session, "server acknowledged terminate"),
            Ok(Err(err)) => debug!(%session, error = %err, "terminate failed"),
            Err(_) => debug!(%session, "terminate timed out"),
        }
    }

    fn fail(&mut self, err: ChannelError, channel: &Channel) {
        if !self.transition(ChannelState::Error) {
            return;
        }
        self.teardown();
        warn!(session = ?self.session, kind = %err.kind(), error = %err, "channel failed");
        self.handler.on_error(channel, &err);
    }

    fn transition(&self, next: ChannelState) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            debug!(%current, %next, "ignoring state transition");
            return false;
        }
        self.core.state.send_replace(next);
        true
    }

    fn teardown(&mut self) {
        for task in [self.handshake.take(), self.handshake_deadline.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some(forward) = self.forward.take() {
            forward.abort();
        }
        if let Some(back) = self.back.take() {
            back.abort();
        }
    }
}
