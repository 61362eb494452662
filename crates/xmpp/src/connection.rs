//! Connection lifecycle: connect with retries, the reader and writer tasks,
//! loss detection, automatic reconnection and orderly shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::sm::{Nonza, R};

use crate::codec::{Packet, XmppCodec};
use crate::collector::{CollectorConfig, ReplyCollector};
use crate::config::ConnectionConfig;
use crate::element::Element;
use crate::error::ConnectionError;
use crate::filter::{IqReplyFilter, StanzaFilter};
use crate::iq_handler::IqHandlers;
use crate::negotiation::{Negotiated, Negotiator, parse_stream_error};
use crate::ns;
use crate::registry::StanzaRegistry;
use crate::router::{
    AsyncStanzaListener, ListenerId, StanzaInterceptor, StanzaListener, StanzaRouter,
};
use crate::session::StreamSessionContext;
use crate::stanza::{Iq, Stanza};
use crate::state::{ConnectionState, StateCell};
use crate::stream_management::{
    StreamManagementAction, StreamManagementCounters, StreamManager, decode_nonza, encode_nonza,
};
use crate::transport::{DefaultConnector, TransportConnector, TransportReader, TransportWriter};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Nonzas and replays the reader hands to the writer.
const CONTROL_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Lifecycle transitions; negotiation steps are only visible through
    /// [`XmppConnection::subscribe_state`].
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Established {
        jid: Jid,
    },
    Resumed {
        jid: Jid,
        replayed: usize,
    },
    Lost {
        reason: String,
        will_retry: bool,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Error {
        message: String,
        recoverable: bool,
    },
}

#[derive(Debug)]
enum Outbound {
    /// Passed through the outgoing interceptors, then tracked for
    /// acknowledgement when stream management is enabled.
    Stanza(Stanza),
    /// Handed back by a refused resumption; tracked again.
    Resend(Element),
    /// Already tracked; sent again after resumption.
    Replay(Element),
    Nonza(Element),
}

/// The live reader/writer pair of one established stream.
struct Link {
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    writer: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn TransportConnector>,
    registry: Arc<StanzaRegistry>,
    router: StanzaRouter,
    iq_handlers: IqHandlers,
    state: StateCell,
    session: RwLock<Option<Arc<StreamSessionContext>>>,
    /// Address of the last session, used to resume it.
    resume_jid: Mutex<Option<Jid>>,
    stream_management: Mutex<StreamManager>,
    /// Signalled by the reader whenever the server acknowledges stanzas.
    acked: Notify,
    events: broadcast::Sender<ConnectionEvent>,
    link: Mutex<Option<Link>>,
    next_generation: AtomicU64,
    /// Cancelled by `disconnect`; replaced by the next `connect`.
    lifecycle: Mutex<CancellationToken>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Handle to one XMPP client connection. Clones share the connection.
#[derive(Clone)]
pub struct XmppConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for XmppConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppConnection")
            .field("jid", &self.inner.config.jid)
            .field("state", &self.inner.state.get())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl XmppConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(DefaultConnector))
    }

    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn TransportConnector>) -> Self {
        Self::with_registry(config, connector, Arc::new(StanzaRegistry::with_defaults()))
    }

    pub fn with_registry(
        config: ConnectionConfig,
        connector: Arc<dyn TransportConnector>,
        registry: Arc<StanzaRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stream_management =
            StreamManager::with_max_resumption(config.stream_management.max_resumption)
                .with_max_unacked(config.stream_management.max_unacked);
        let router = StanzaRouter::with_listener_capacity(config.listener_queue_capacity);
        let iq_handlers = IqHandlers::with_defaults(config.unknown_iq_reply);

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                registry,
                router,
                iq_handlers,
                state: StateCell::new(),
                session: RwLock::new(None),
                resume_jid: Mutex::new(None),
                stream_management: Mutex::new(stream_management),
                acked: Notify::new(),
                events,
                link: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                lifecycle: Mutex::new(CancellationToken::new()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<StanzaRegistry> {
        &self.inner.registry
    }

    /// Handlers answering inbound IQ `get`/`set` requests.
    pub fn iq_handlers(&self) -> &IqHandlers {
        &self.inner.iq_handlers
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The current session, if connected.
    pub fn session(&self) -> Option<Arc<StreamSessionContext>> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connects and negotiates, retrying retryable failures according to the
    /// reconnect policy. Returns the established session.
    pub async fn connect(&self) -> Result<Arc<StreamSessionContext>, ConnectionError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.inner.state.get() == ConnectionState::Connected {
            if let Some(session) = self.session() {
                return Ok(session);
            }
        }

        let lifecycle = self.inner.fresh_lifecycle();
        Inner::connect_loop(&self.inner, &lifecycle, false).await
    }

    /// Closes the stream and transport, cancels any negotiation or pending
    /// reconnect and wakes every waiting collector. Calling it again has no
    /// effect.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Queues a stanza for the writer. Waits while the send queue is full,
    /// which includes while the server is behind on acknowledgements.
    pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<(), ConnectionError> {
        self.inner.enqueue(Outbound::Stanza(stanza.into())).await
    }

    /// Sends an IQ `get` or `set` and waits for its `result`. An `error` reply
    /// becomes [`ConnectionError::Stanza`].
    pub async fn send_iq_request(&self, iq: Iq) -> Result<Arc<Stanza>, ConnectionError> {
        if !iq.iq_type.is_request() {
            return Err(ConnectionError::Configuration(format!(
                "an IQ of type '{}' does not expect a reply",
                iq.iq_type.as_str()
            )));
        }

        let mut stanza = <Stanza as From<_>>::from(iq);
        let id = stanza.ensure_id().to_string();
        let local = self.session().map(|session| session.jid.clone());
        let filter = IqReplyFilter::new(id.clone(), stanza.to(), local.as_ref());

        let mut collector = self
            .inner
            .router
            .create_collector(filter, CollectorConfig::single_reply(id));
        self.send(stanza).await?;
        collector
            .next_result_or_error(self.inner.config.reply_timeout)
            .await
    }

    pub fn create_collector(
        &self,
        filter: impl StanzaFilter + 'static,
        config: CollectorConfig,
    ) -> ReplyCollector {
        self.inner.router.create_collector(filter, config)
    }

    pub fn add_sync_listener(
        &self,
        filter: impl StanzaFilter + 'static,
        listener: impl StanzaListener + 'static,
    ) -> ListenerId {
        self.inner.router.add_sync_listener(filter, listener)
    }

    pub fn add_async_listener(
        &self,
        filter: impl StanzaFilter + 'static,
        listener: impl AsyncStanzaListener + 'static,
    ) -> ListenerId {
        self.inner.router.add_async_listener(filter, listener)
    }

    /// Registers an interceptor that may modify matching stanzas right
    /// before they are written.
    pub fn add_outgoing_interceptor(
        &self,
        filter: impl StanzaFilter + 'static,
        interceptor: impl StanzaInterceptor + 'static,
    ) -> ListenerId {
        self.inner.router.add_outgoing_interceptor(filter, interceptor)
    }

    pub fn add_sending_listener(
        &self,
        filter: impl StanzaFilter + 'static,
        listener: impl StanzaListener + 'static,
    ) -> ListenerId {
        self.inner.router.add_sending_listener(filter, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.router.remove_listener(id)
    }

    /// Live stream-management counters; all zero while it is not enabled.
    pub fn sm_counters(&self) -> StreamManagementCounters {
        self.inner.sm().counters()
    }

    /// Asks the server to acknowledge what it has received so far.
    pub async fn request_ack(&self) -> Result<(), ConnectionError> {
        let Some(nonza) = self.inner.sm().ack_request() else {
            return Err(ConnectionError::Configuration(
                "stream management is not enabled".to_string(),
            ));
        };
        self.inner.enqueue(Outbound::Nonza(encode_nonza(nonza)?)).await
    }
}

impl Inner {
    fn sm(&self) -> MutexGuard<'_, StreamManager> {
        lock(&self.stream_management)
    }

    fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: ConnectionState) {
        if let Some(previous) = self.state.transition(next) {
            self.emit(ConnectionEvent::StateChanged {
                from: previous,
                to: next,
            });
        }
    }

    fn fresh_lifecycle(&self) -> CancellationToken {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.is_cancelled() {
            *lifecycle = CancellationToken::new();
        }
        lifecycle.clone()
    }

    fn current_lifecycle(&self) -> CancellationToken {
        lock(&self.lifecycle).clone()
    }

    fn set_session(&self, session: Option<Arc<StreamSessionContext>>) {
        *self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session;
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<(), ConnectionError> {
        if self.state.get() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let sender = lock(&self.link)
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(ConnectionError::NotConnected)?;
        sender
            .send(outbound)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }

    async fn connect_loop(
        self: &Arc<Self>,
        lifecycle: &CancellationToken,
        delay_first_attempt: bool,
    ) -> Result<Arc<StreamSessionContext>, ConnectionError> {
        let policy = &self.config.reconnect;
        let mut attempt = 0_u32;

        if delay_first_attempt {
            attempt = 1;
            self.wait_before_attempt(lifecycle, attempt).await?;
        }

        loop {
            self.set_state(ConnectionState::Connecting);
            let error = match self.establish(lifecycle).await {
                Ok(session) => return Ok(session),
                Err(error) => error,
            };

            let next_attempt = attempt.saturating_add(1);
            let will_retry =
                error.is_retryable() && policy.should_retry(next_attempt) && !lifecycle.is_cancelled();
            self.emit(ConnectionEvent::Error {
                message: error.to_string(),
                recoverable: will_retry,
            });

            if !will_retry {
                warn!(%error, attempts = next_attempt, "giving up on connecting");
                let terminal = match error {
                    ConnectionError::Cancelled => ConnectionState::Disconnected,
                    _ => ConnectionState::Failed,
                };
                self.set_state(terminal);
                return Err(error);
            }

            warn!(%error, attempt = next_attempt, "connection attempt failed");
            self.set_state(ConnectionState::Disconnected);
            self.wait_before_attempt(lifecycle, next_attempt).await?;
            attempt = next_attempt;
        }
    }

    async fn wait_before_attempt(
        &self,
        lifecycle: &CancellationToken,
        attempt: u32,
    ) -> Result<(), ConnectionError> {
        let delay = self.config.reconnect.delay(attempt);
        info!(attempt, ?delay, "reconnecting");
        self.emit(ConnectionEvent::Reconnecting { attempt, delay });

        tokio::select! {
            _ = lifecycle.cancelled() => {
                self.set_state(ConnectionState::Disconnected);
                Err(ConnectionError::Cancelled)
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn establish(
        self: &Arc<Self>,
        lifecycle: &CancellationToken,
    ) -> Result<Arc<StreamSessionContext>, ConnectionError> {
        let transport = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => return Err(ConnectionError::Cancelled),
            result = timeout(self.config.negotiation_timeout, self.connector.connect(&self.config)) => {
                result.map_err(|_| ConnectionError::Timeout { phase: "connect" })??
            }
        };

        let previous_jid = lock(&self.resume_jid).clone();
        let Negotiated {
            stream,
            session,
            replay,
            early_stanzas,
        } = Negotiator::new(&self.config, &self.state, &self.stream_management, lifecycle)
            .resuming(previous_jid)
            .negotiate(transport)
            .await?;

        let resumed = session
            .stream_management
            .as_ref()
            .is_some_and(|sm| sm.resumed);
        let session = Arc::new(session);
        let (transport, codec, buffer) = stream.into_parts()?;
        let (reader, writer) = transport.split();

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shutdown = lifecycle.child_token();
        let (outbound, outbound_queue) = mpsc::channel(self.config.send_queue_capacity.max(1));
        let (control, control_queue) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        // Unacknowledged stanzas go out before anything the application sends.
        let replayed = replay.len();
        let replay = replay
            .into_iter()
            .map(|element| {
                if resumed {
                    Outbound::Replay(element)
                } else {
                    Outbound::Resend(element)
                }
            })
            .collect();

        let writer = tokio::spawn(run_writer(
            LinkWriter::new(Arc::clone(self), writer, shutdown.clone(), generation),
            replay,
            outbound_queue,
            control_queue,
        ));
        *lock(&self.link) = Some(Link {
            generation,
            outbound: outbound.clone(),
            shutdown: shutdown.clone(),
            writer,
        });
        *lock(&self.resume_jid) = Some(session.jid.clone());
        self.set_session(Some(Arc::clone(&session)));

        self.set_state(ConnectionState::Connected);
        if resumed {
            self.emit(ConnectionEvent::Resumed {
                jid: session.jid.clone(),
                replayed,
            });
        } else {
            self.emit(ConnectionEvent::Established {
                jid: session.jid.clone(),
            });
        }

        tokio::spawn(run_reader(
            Arc::clone(self),
            reader,
            ReaderState {
                codec,
                buffer,
                early_stanzas,
            },
            ReaderQueues { outbound, control },
            shutdown,
            generation,
        ));

        Ok(session)
    }

    /// Tears down the link of `generation` after a transport failure or a
    /// server-side close and schedules a reconnect when allowed.
    fn connection_lost(self: &Arc<Self>, generation: u64, error: ConnectionError) {
        let link = {
            let mut current = lock(&self.link);
            match current.as_ref() {
                Some(link) if link.generation == generation => current.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };
        link.shutdown.cancel();

        self.set_session(None);
        self.set_state(ConnectionState::Disconnected);
        self.router.fail_all(&ConnectionError::NotConnected);
        self.sm().prepare_for_reconnect();

        let lifecycle = self.current_lifecycle();
        let will_retry =
            self.config.auto_reconnect && error.is_retryable() && !lifecycle.is_cancelled();
        warn!(%error, will_retry, "connection lost");
        self.emit(ConnectionEvent::Lost {
            reason: error.to_string(),
            will_retry,
        });
        if !error.is_retryable() {
            self.emit(ConnectionEvent::Error {
                message: error.to_string(),
                recoverable: false,
            });
        }

        if will_retry {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let _guard = inner.connect_lock.lock().await;
                if lifecycle.is_cancelled() || inner.state.get() == ConnectionState::Connected {
                    return;
                }
                if let Err(error) = Inner::connect_loop(&inner, &lifecycle, true).await {
                    debug!(%error, "automatic reconnect ended");
                }
            });
        }
    }

    async fn disconnect(&self) {
        lock(&self.lifecycle).cancel();

        let link = lock(&self.link).take();
        let was_connected = link.is_some();
        if let Some(link) = link {
            link.shutdown.cancel();
            drop(link.outbound);
            // The writer flushes its queue and closes the transport on its way out.
            if timeout(self.config.negotiation_timeout, link.writer).await.is_err() {
                warn!("transport did not close in time");
            }
        }

        self.sm().reset();
        self.set_session(None);
        *lock(&self.resume_jid) = None;
        self.router.fail_all(&ConnectionError::NotConnected);
        self.set_state(ConnectionState::Disconnected);

        if was_connected {
            info!("disconnected");
            self.emit(ConnectionEvent::Lost {
                reason: "disconnect requested".to_string(),
                will_retry: false,
            });
        }
    }
}

/// Write half of one link. Stanzas wait here while the server is behind on
/// acknowledging them; nonzas and replays from the reader never wait.
struct LinkWriter {
    inner: Arc<Inner>,
    writer: Box<dyn TransportWriter>,
    namespaced: bool,
    shutdown: CancellationToken,
    generation: u64,
}

impl LinkWriter {
    fn new(
        inner: Arc<Inner>,
        writer: Box<dyn TransportWriter>,
        shutdown: CancellationToken,
        generation: u64,
    ) -> Self {
        let namespaced = writer.requires_stanza_namespace();
        Self {
            inner,
            writer,
            namespaced,
            shutdown,
            generation,
        }
    }

    async fn write(&mut self, element: &Element) -> Result<(), ConnectionError> {
        let xml = if self.namespaced {
            element.to_xml()
        } else {
            element.to_xml_in(ns::CLIENT)
        };
        self.writer.send(xml.as_bytes()).await
    }

    async fn write_tracked(&mut self, element: &Element) -> Result<(), ConnectionError> {
        let request_ack = self.inner.sm().track_outbound_stanza(element);
        self.write(element).await?;
        if request_ack {
            trace!("unacked queue reached its high-water mark, requesting ack");
            self.write(&encode_nonza(Nonza::Req(R))?).await?;
        }
        Ok(())
    }

    /// Returns `false` once the link shuts down while waiting.
    async fn wait_for_ack_room(
        &mut self,
        control: &mut mpsc::Receiver<Element>,
    ) -> Result<bool, ConnectionError> {
        let inner = Arc::clone(&self.inner);
        loop {
            let (request, unacked) = {
                let mut sm = inner.sm();
                if !sm.is_unacked_queue_full() {
                    return Ok(true);
                }
                (sm.pending_ack_request(), sm.counters().unacked)
            };
            if let Some(request) = request {
                debug!(unacked, "unacked queue full, waiting for acknowledgement");
                self.write(&encode_nonza(request)?).await?;
            }

            let shutdown = self.shutdown.clone();
            let control_element = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(false),
                Some(element) = control.recv() => Some(element),
                _ = inner.acked.notified() => None,
            };
            if let Some(element) = control_element {
                self.write(&element).await?;
            }
        }
    }

    async fn deliver(
        &mut self,
        message: Outbound,
        control: &mut mpsc::Receiver<Element>,
    ) -> Result<bool, ConnectionError> {
        match message {
            Outbound::Stanza(mut stanza) => {
                if !self.wait_for_ack_room(control).await? {
                    return Ok(false);
                }
                self.inner.router.intercept_outgoing(&mut stanza);
                self.write_tracked(&stanza.to_element()).await?;
                self.inner.router.notify_sent(&Arc::new(stanza));
            }
            Outbound::Resend(element) => {
                if !self.wait_for_ack_room(control).await? {
                    return Ok(false);
                }
                self.write_tracked(&element).await?;
            }
            Outbound::Replay(element) | Outbound::Nonza(element) => self.write(&element).await?,
        }
        Ok(true)
    }

    async fn run(
        &mut self,
        replay: Vec<Outbound>,
        mut queue: mpsc::Receiver<Outbound>,
        mut control: mpsc::Receiver<Element>,
    ) -> Result<(), ConnectionError> {
        for message in replay {
            if !self.deliver(message, &mut control).await? {
                return Ok(());
            }
        }

        let shutdown = self.shutdown.clone();
        loop {
            let message = tokio::select! {
                biased;
                Some(element) = control.recv() => Outbound::Nonza(element),
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => return Ok(()),
                },
                _ = shutdown.cancelled() => return Ok(()),
            };
            if !self.deliver(message, &mut control).await? {
                return Ok(());
            }
        }
    }
}

async fn run_writer(
    mut link: LinkWriter,
    replay: Vec<Outbound>,
    queue: mpsc::Receiver<Outbound>,
    control: mpsc::Receiver<Element>,
) {
    if let Err(error) = link.run(replay, queue, control).await {
        link.inner.connection_lost(link.generation, error);
    }

    if let Err(error) = link.writer.close().await {
        debug!(%error, "error while closing transport");
    }
}

struct ReaderState {
    codec: XmppCodec,
    buffer: BytesMut,
    early_stanzas: Vec<Element>,
}

/// Where the reader sends what it produces. IQ replies are ordinary stanzas;
/// stream-management answers and replays bypass the send queue.
struct ReaderQueues {
    outbound: mpsc::Sender<Outbound>,
    control: mpsc::Sender<Element>,
}

async fn run_reader(
    inner: Arc<Inner>,
    mut reader: Box<dyn TransportReader>,
    state: ReaderState,
    queues: ReaderQueues,
    shutdown: CancellationToken,
    generation: u64,
) {
    let result = read_stanzas(&inner, reader.as_mut(), state, &queues, &shutdown).await;
    if let Err(error) = result {
        if !shutdown.is_cancelled() {
            inner.connection_lost(generation, error);
        }
    }
}

async fn read_stanzas(
    inner: &Arc<Inner>,
    reader: &mut dyn TransportReader,
    state: ReaderState,
    queues: &ReaderQueues,
    shutdown: &CancellationToken,
) -> Result<(), ConnectionError> {
    let ReaderState {
        mut codec,
        mut buffer,
        early_stanzas,
    } = state;

    // Received before stream management was enabled, so they do not count
    // towards the handled counter.
    for element in early_stanzas {
        handle_element(inner, element, queues, false).await?;
    }

    loop {
        while let Some(packet) = codec.decode(&mut buffer)? {
            match packet {
                Packet::Stanza(element) => handle_element(inner, element, queues, true).await?,
                Packet::StreamEnd => {
                    return Err(ConnectionError::Transport(
                        "server closed the stream".to_string(),
                    ));
                }
                Packet::StreamStart(_) => {
                    return Err(ConnectionError::ProtocolViolation(
                        "unexpected stream header on an established stream".to_string(),
                    ));
                }
            }
        }

        let chunk = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            chunk = reader.recv() => chunk?,
        };
        match chunk {
            Some(chunk) => buffer.extend_from_slice(&chunk),
            None => {
                return Err(ConnectionError::Transport(
                    "connection closed by peer".to_string(),
                ));
            }
        }
    }
}

async fn handle_element(
    inner: &Arc<Inner>,
    element: Element,
    queues: &ReaderQueues,
    counted: bool,
) -> Result<(), ConnectionError> {
    if element.is("error", ns::STREAM) {
        return Err(parse_stream_error(&element));
    }

    if let Some(nonza) = decode_nonza(&element) {
        let actions = inner.sm().process_nonza(nonza)?;
        inner.acked.notify_one();
        for action in actions {
            let elements = match action {
                StreamManagementAction::SendNonza(nonza) => vec![encode_nonza(nonza)?],
                StreamManagementAction::ReplayStanzas(stanzas) => stanzas,
            };
            for element in elements {
                // A closed queue means the link is already being torn down.
                let _ = queues.control.send(element).await;
            }
        }
        return Ok(());
    }

    if counted {
        inner.sm().mark_inbound_handled();
    }

    let stanza = match inner.registry.decode_stanza(&element) {
        Ok(stanza) => stanza,
        Err(error) => {
            warn!(%error, element = element.name(), "dropping undecodable stanza");
            return Ok(());
        }
    };

    match stanza {
        Stanza::Iq(iq) if iq.iq_type.is_request() => {
            let inner = Arc::clone(inner);
            let outbound = queues.outbound.clone();
            tokio::spawn(async move {
                if let Some(reply) = inner.iq_handlers.handle(&iq).await {
                    let _ = outbound.send(Outbound::Stanza(<Stanza as From<_>>::from(reply))).await;
                }
            });
        }
        stanza => inner.router.dispatch(Arc::new(stanza)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tracing_test::traced_test;

    use super::*;
    use crate::reconnect::{BackoffStrategy, ReconnectPolicy};
    use crate::stanza::{Message, Ping};
    use crate::transport::MockTransportConnector;

    fn config(max_attempts: u32) -> ConnectionConfig {
        let mut config = ConnectionConfig::new("alice@example.com".parse().expect("valid JID"), "secret");
        config.reconnect =
            ReconnectPolicy::new(BackoffStrategy::Fixed(Duration::from_secs(2)), max_attempts)
                .without_jitter();
        config
    }

    #[tokio::test]
    async fn sending_before_connect_is_rejected() {
        let connection = XmppConnection::with_connector(config(0), Arc::new(MockTransportConnector::new()));

        let result = connection
            .send(Message::chat("bob@example.com".parse().expect("valid JID"), "hi"))
            .await;
        assert_matches!(result, Err(ConnectionError::NotConnected));

        let result = connection.send_iq_request(Iq::get(None, Ping)).await;
        assert_matches!(result, Err(ConnectionError::NotConnected));
        assert_eq!(connection.inner.router.pending_collectors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried_up_to_max_attempts() {
        let mut connector = MockTransportConnector::new();
        connector
            .expect_connect()
            .times(3)
            .returning(|_| Err(ConnectionError::Transport("connection refused".to_string())));
        let connection = XmppConnection::with_connector(config(2), Arc::new(connector));
        let mut events = connection.subscribe_events();

        let result = connection.connect().await;

        assert_matches!(result, Err(ConnectionError::Transport(_)));
        assert_eq!(connection.state(), ConnectionState::Failed);

        let mut reconnect_attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Reconnecting { attempt, delay } = event {
                assert_eq!(delay, Duration::from_secs(2));
                reconnect_attempts.push(attempt);
            }
        }
        assert_eq!(reconnect_attempts, vec![1, 2]);
    }

    #[tokio::test]
    #[traced_test]
    async fn configuration_errors_are_not_retried() {
        let mut connector = MockTransportConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(ConnectionError::Configuration("bad server URL".to_string())));
        let connection = XmppConnection::with_connector(config(0), Arc::new(connector));

        let result = connection.connect().await;

        assert_matches!(result, Err(ConnectionError::Configuration(_)));
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert!(logs_contain("giving up on connecting"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let mut connector = MockTransportConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(ConnectionError::Transport("connection refused".to_string())));
        let connection = XmppConnection::with_connector(config(0), Arc::new(connector));

        let connecting = tokio::spawn({
            let connection = connection.clone();
            async move { connection.connect().await }
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        connection.disconnect().await;

        let result = connecting.await.expect("connect task completes");
        assert_matches!(result, Err(ConnectionError::Cancelled));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // Idempotent.
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn request_ack_requires_stream_management() {
        let connection = XmppConnection::with_connector(config(0), Arc::new(MockTransportConnector::new()));
        assert_matches!(
            connection.request_ack().await,
            Err(ConnectionError::Configuration(_))
        );
    }
}
