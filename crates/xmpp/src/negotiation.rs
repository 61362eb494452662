//! Brings a freshly connected transport to a bound, ready session.
//!
//! The steps follow RFC 6120: open the stream, optionally upgrade with
//! StartTLS, authenticate with SASL, restart, then either resume a previous
//! XEP-0198 session or bind a resource (plus legacy session establishment
//! and stream management enablement). Every wait is bounded by the
//! negotiation timeout and aborts as soon as the cancellation token fires.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::sm::Nonza;

use crate::codec::{Packet, StreamHeader, XmppCodec};
use crate::config::{ConnectionConfig, TlsPolicy};
use crate::element::Element;
use crate::error::ConnectionError;
use crate::features::StreamFeatures;
use crate::ns;
use crate::sasl::{self, SaslCredentials};
use crate::session::StreamSessionContext;
use crate::stanza::{Bind, Iq, IqType, Session, Stanza, StanzaError};
use crate::state::{ConnectionState, StateCell};
use crate::stream_management::{StreamManagementAction, StreamManager, decode_nonza, encode_nonza};
use crate::transport::Transport;

/// A transport together with the decoder state of the stream it carries.
pub struct XmppStream {
    transport: Option<Box<dyn Transport>>,
    codec: XmppCodec,
    buffer: BytesMut,
}

impl XmppStream {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            codec: XmppCodec::new(),
            buffer: BytesMut::new(),
        }
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>, ConnectionError> {
        self.transport.as_mut().ok_or(ConnectionError::NotConnected)
    }

    pub fn is_secure(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.is_secure())
    }

    pub fn supports_starttls(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.supports_starttls())
    }

    /// Starts a new stream; the decoder forgets the previous document.
    pub async fn open(&mut self, header: &StreamHeader) -> Result<(), ConnectionError> {
        self.codec.reset();
        self.buffer.clear();
        self.transport()?.open_stream(header).await
    }

    pub async fn send_element(&mut self, element: &Element) -> Result<(), ConnectionError> {
        let transport = self.transport()?;
        let xml = if transport.requires_stanza_namespace() {
            element.to_xml()
        } else {
            element.to_xml_in(ns::CLIENT)
        };
        transport.send(xml.as_bytes()).await
    }

    pub async fn next_packet(&mut self) -> Result<Packet, ConnectionError> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buffer)? {
                return Ok(packet);
            }
            match self.transport()?.recv().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    return Err(ConnectionError::Transport(
                        "connection closed by peer".to_string(),
                    ));
                }
            }
        }
    }

    async fn start_tls(&mut self, domain: String) -> Result<(), ConnectionError> {
        let transport = self.transport.take().ok_or(ConnectionError::NotConnected)?;
        self.transport = Some(transport.start_tls(domain).await?);
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(error) = transport.close().await {
                debug!(%error, "error while closing transport");
            }
        }
    }

    /// Hands over the transport along with any bytes already read but not
    /// yet decoded.
    pub fn into_parts(self) -> Result<(Box<dyn Transport>, XmppCodec, BytesMut), ConnectionError> {
        let transport = self.transport.ok_or(ConnectionError::NotConnected)?;
        Ok((transport, self.codec, self.buffer))
    }
}

impl std::fmt::Debug for XmppStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppStream")
            .field("secure", &self.is_secure())
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug)]
pub struct Negotiated {
    pub stream: XmppStream,
    pub session: StreamSessionContext,
    /// Unacknowledged stanzas to send again, oldest first.
    pub replay: Vec<Element>,
    /// Stanzas that arrived while negotiation was still waiting for a reply.
    pub early_stanzas: Vec<Element>,
}

pub(crate) fn parse_stream_error(element: &Element) -> ConnectionError {
    let condition = element
        .children()
        .find(|child| child.ns() == ns::STREAMS && child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = element
        .get_child("text", ns::STREAMS)
        .map(Element::text)
        .filter(|text| !text.is_empty());
    ConnectionError::StreamError { condition, text }
}

pub struct Negotiator<'a> {
    config: &'a ConnectionConfig,
    state: &'a StateCell,
    stream_management: &'a Mutex<StreamManager>,
    cancel: &'a CancellationToken,
    /// Address of the session being resumed, if any.
    previous_jid: Option<Jid>,
}

impl<'a> Negotiator<'a> {
    pub fn new(
        config: &'a ConnectionConfig,
        state: &'a StateCell,
        stream_management: &'a Mutex<StreamManager>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            stream_management,
            cancel,
            previous_jid: None,
        }
    }

    pub fn resuming(mut self, previous_jid: Option<Jid>) -> Self {
        self.previous_jid = previous_jid;
        self
    }

    fn sm(&self) -> MutexGuard<'_, StreamManager> {
        self.stream_management
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the whole negotiation. The transport is closed on failure.
    pub async fn negotiate(self, transport: Box<dyn Transport>) -> Result<Negotiated, ConnectionError> {
        let mut stream = XmppStream::new(transport);
        let mut early_stanzas = Vec::new();
        match self.run(&mut stream, &mut early_stanzas).await {
            Ok((session, replay)) => Ok(Negotiated {
                stream,
                session,
                replay,
                early_stanzas,
            }),
            Err(error) => {
                self.sm().on_connect_attempt_failed();
                stream.close().await;
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        stream: &mut XmppStream,
        early_stanzas: &mut Vec<Element>,
    ) -> Result<(StreamSessionContext, Vec<Element>), ConnectionError> {
        let (_, mut features) = self.open_stream(stream).await?;

        features = self.negotiate_tls(stream, features).await?;

        let mechanism = self.authenticate(stream, &features).await?;
        let (header, features) = self.open_stream(stream).await?;

        let sm_config = &self.config.stream_management;
        let mut replay = Vec::new();

        if features.stream_management && sm_config.enabled && self.sm().can_resume() {
            match self.resume(stream, early_stanzas).await? {
                ResumeOutcome::Resumed(pending) => {
                    let jid = self
                        .previous_jid
                        .clone()
                        .unwrap_or_else(|| self.config.jid.clone());
                    info!(%jid, replayed = pending.len(), "stream resumed");
                    let session = StreamSessionContext {
                        jid,
                        stream_id: header.id,
                        features: features.identifiers(),
                        mechanism: Some(mechanism),
                        encrypted: stream.is_secure(),
                        stream_management: Some(self.sm().info(true)),
                    };
                    return Ok((session, pending));
                }
                ResumeOutcome::Failed(pending) => replay = pending,
            }
        } else {
            replay = self.sm().abandon_resumption();
        }

        self.state.transition(ConnectionState::ResourceBinding);
        let jid = self.bind(stream, &features, early_stanzas).await?;

        if features.session_required() {
            self.establish_session(stream, early_stanzas).await?;
        }

        if features.stream_management && sm_config.enabled {
            self.enable_stream_management(stream, early_stanzas).await?;
        }

        info!(%jid, %mechanism, "session established");
        let stream_management = {
            let sm = self.sm();
            sm.is_enabled().then(|| sm.info(false))
        };
        let session = StreamSessionContext {
            jid,
            stream_id: header.id,
            features: features.identifiers(),
            mechanism: Some(mechanism),
            encrypted: stream.is_secure(),
            stream_management,
        };
        Ok((session, replay))
    }

    /// Bounds `operation` by the negotiation timeout and the cancellation token.
    async fn guarded<T>(
        &self,
        phase: &'static str,
        operation: impl Future<Output = Result<T, ConnectionError>>,
    ) -> Result<T, ConnectionError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectionError::Cancelled),
            result = timeout(self.config.negotiation_timeout, operation) => {
                result.map_err(|_| ConnectionError::Timeout { phase })?
            }
        }
    }

    async fn send(
        &self,
        stream: &mut XmppStream,
        phase: &'static str,
        element: &Element,
    ) -> Result<(), ConnectionError> {
        self.guarded(phase, stream.send_element(element)).await
    }

    /// Next top-level element; stream errors and stream ends become failures.
    async fn next_element(
        &self,
        stream: &mut XmppStream,
        phase: &'static str,
    ) -> Result<Element, ConnectionError> {
        match self.guarded(phase, stream.next_packet()).await? {
            Packet::Stanza(element) if element.is("error", ns::STREAM) => {
                Err(parse_stream_error(&element))
            }
            Packet::Stanza(element) => Ok(element),
            Packet::StreamStart(_) => Err(ConnectionError::ProtocolViolation(format!(
                "unexpected stream header during {phase}"
            ))),
            Packet::StreamEnd => Err(ConnectionError::Transport(format!(
                "server closed the stream during {phase}"
            ))),
        }
    }

    async fn open_stream(
        &self,
        stream: &mut XmppStream,
    ) -> Result<(StreamHeader, StreamFeatures), ConnectionError> {
        let header = StreamHeader::client(self.config.domain()).with_lang(self.config.lang.clone());
        self.guarded("stream open", stream.open(&header)).await?;

        let server_header = loop {
            match self.guarded("stream open", stream.next_packet()).await? {
                Packet::StreamStart(server_header) => break server_header,
                Packet::Stanza(element) if element.is("error", ns::STREAM) => {
                    return Err(parse_stream_error(&element));
                }
                Packet::Stanza(element) => {
                    return Err(ConnectionError::ProtocolViolation(format!(
                        "expected a stream header, received <{}/>",
                        element.name()
                    )));
                }
                Packet::StreamEnd => {
                    return Err(ConnectionError::Transport(
                        "server closed the stream before opening it".to_string(),
                    ));
                }
            }
        };
        self.state.transition(ConnectionState::StreamOpened);
        debug!(id = ?server_header.id, from = ?server_header.from, "stream opened");

        let element = self.next_element(stream, "stream features").await?;
        if !element.is("features", ns::STREAM) {
            return Err(ConnectionError::ProtocolViolation(format!(
                "expected <stream:features/>, received <{}/>",
                element.name()
            )));
        }
        let features = StreamFeatures::from_element(&element);
        debug!(features = ?features.identifiers(), "received stream features");
        Ok((server_header, features))
    }

    async fn negotiate_tls(
        &self,
        stream: &mut XmppStream,
        features: StreamFeatures,
    ) -> Result<StreamFeatures, ConnectionError> {
        let secure = stream.is_secure();
        let offered = features.starttls.is_some();
        let available = offered && stream.supports_starttls();

        let upgrade = match self.config.tls {
            _ if secure => false,
            TlsPolicy::Disabled if features.starttls_required() => {
                return Err(ConnectionError::Configuration(
                    "server requires TLS but TLS is disabled".to_string(),
                ));
            }
            TlsPolicy::Disabled => false,
            TlsPolicy::Required if !available => {
                return Err(ConnectionError::Configuration(
                    "TLS is required but neither the server nor the transport provides it"
                        .to_string(),
                ));
            }
            TlsPolicy::IfPossible if features.starttls_required() && !available => {
                return Err(ConnectionError::Configuration(
                    "server requires TLS but the transport cannot upgrade".to_string(),
                ));
            }
            TlsPolicy::IfPossible if offered && !available => {
                debug!("server offers StartTLS but the transport cannot upgrade, continuing in the clear");
                false
            }
            TlsPolicy::Required | TlsPolicy::IfPossible => available,
        };

        if !upgrade {
            return Ok(features);
        }

        self.state.transition(ConnectionState::TlsNegotiating);
        self.send(stream, "starttls", &Element::new("starttls", ns::TLS))
            .await?;

        let reply = self.next_element(stream, "starttls").await?;
        match (reply.name(), reply.ns()) {
            ("proceed", ns::TLS) => {}
            ("failure", ns::TLS) => {
                return Err(ConnectionError::Tls(
                    "server refused to proceed with StartTLS".to_string(),
                ));
            }
            (name, _) => {
                return Err(ConnectionError::ProtocolViolation(format!(
                    "unexpected <{name}/> in reply to <starttls/>"
                )));
            }
        }

        self.guarded("tls handshake", stream.start_tls(self.config.domain()))
            .await?;
        debug!("TLS established");

        let (_, features) = self.open_stream(stream).await?;
        Ok(features)
    }

    async fn authenticate(
        &self,
        stream: &mut XmppStream,
        features: &StreamFeatures,
    ) -> Result<String, ConnectionError> {
        let name = self
            .config
            .mechanisms
            .select(
                &features.offered_mechanisms(),
                stream.is_secure(),
                self.config.allow_plain_without_tls,
            )
            .ok_or_else(|| ConnectionError::Sasl {
                condition: "invalid-mechanism".to_string(),
                text: Some(format!(
                    "no acceptable mechanism among {:?}",
                    features.mechanisms
                )),
            })?
            .to_string();

        let username = self.config.username().ok_or_else(|| {
            ConnectionError::Configuration("the account JID has no localpart".to_string())
        })?;
        let credentials = SaslCredentials {
            username,
            password: self.config.password.clone(),
        };
        let mut mechanism = self.config.mechanisms.build(&name, &credentials)?;

        self.state.transition(ConnectionState::Authenticating);
        debug!(mechanism = %name, "starting SASL authentication");

        let initial = mechanism.initial_response()?;
        self.send(stream, "sasl", &sasl::auth_element(&name, initial.as_deref()))
            .await?;

        loop {
            let element = self.next_element(stream, "sasl").await?;
            if element.ns() != ns::SASL {
                return Err(ConnectionError::ProtocolViolation(format!(
                    "unexpected <{}/> during SASL",
                    element.name()
                )));
            }
            match element.name() {
                "challenge" => {
                    let challenge = sasl::decode_payload(&element.text())?;
                    let response = mechanism.evaluate_challenge(&challenge)?;
                    self.send(stream, "sasl", &sasl::response_element(&response))
                        .await?;
                }
                "success" => {
                    let additional = sasl::decode_payload(&element.text())?;
                    mechanism.verify_success(&additional)?;
                    break;
                }
                "failure" => {
                    let error = sasl::map_failure(&element);
                    warn!(mechanism = %name, %error, "SASL authentication failed");
                    return Err(error);
                }
                other => {
                    return Err(ConnectionError::ProtocolViolation(format!(
                        "unexpected <{other}/> during SASL"
                    )));
                }
            }
        }

        if !mechanism.is_complete() {
            return Err(ConnectionError::Sasl {
                condition: "incomplete-exchange".to_string(),
                text: Some("server reported success before the mechanism finished".to_string()),
            });
        }
        debug!(mechanism = %name, qop = ?mechanism.negotiated_qop(), "authenticated");
        Ok(name)
    }

    async fn resume(
        &self,
        stream: &mut XmppStream,
        early_stanzas: &mut Vec<Element>,
    ) -> Result<ResumeOutcome, ConnectionError> {
        let Some(request) = self.sm().on_stream_started(true) else {
            return Ok(ResumeOutcome::Failed(Vec::new()));
        };
        if !matches!(request, Nonza::Resume(_)) {
            // The previous session expired while we were away.
            return Ok(ResumeOutcome::Failed(self.sm().abandon_resumption()));
        }
        self.send(stream, "resumption", &encode_nonza(request)?)
            .await?;

        loop {
            let element = self.next_element(stream, "resumption").await?;
            let Some(nonza) = decode_nonza(&element) else {
                early_stanzas.push(element);
                continue;
            };
            let resumed = matches!(nonza, Nonza::Resumed(_));
            if !resumed && !matches!(nonza, Nonza::Failed(_)) {
                debug!(element = %element, "ignoring stream-management element during resumption");
                continue;
            }

            let pending = self
                .sm()
                .process_nonza(nonza)?
                .into_iter()
                .find_map(|action| match action {
                    StreamManagementAction::ReplayStanzas(stanzas) => Some(stanzas),
                    StreamManagementAction::SendNonza(_) => None,
                })
                .unwrap_or_default();

            return Ok(if resumed {
                ResumeOutcome::Resumed(pending)
            } else {
                info!(pending = pending.len(), "resumption failed, binding a new session");
                ResumeOutcome::Failed(pending)
            });
        }
    }

    /// Sends `iq` and waits for the reply carrying its id.
    async fn exchange_iq(
        &self,
        stream: &mut XmppStream,
        phase: &'static str,
        iq: Iq,
        early_stanzas: &mut Vec<Element>,
    ) -> Result<Element, ConnectionError> {
        let mut stanza = <Stanza as From<_>>::from(iq);
        let id = stanza.ensure_id().to_string();
        self.send(stream, phase, &stanza.to_element()).await?;

        loop {
            let element = self.next_element(stream, phase).await?;
            let is_reply = element.is("iq", ns::CLIENT)
                && element.attr("id") == Some(id.as_str())
                && matches!(element.attr("type"), Some("result" | "error"));
            if is_reply {
                return Ok(element);
            }
            early_stanzas.push(element);
        }
    }

    async fn bind(
        &self,
        stream: &mut XmppStream,
        features: &StreamFeatures,
        early_stanzas: &mut Vec<Element>,
    ) -> Result<Jid, ConnectionError> {
        if !features.bind {
            return Err(ConnectionError::Bind(
                "server did not offer resource binding".to_string(),
            ));
        }

        let request = Iq::set(None, Bind::request(self.config.resource()));
        let reply = self
            .exchange_iq(stream, "resource binding", request, early_stanzas)
            .await?;

        if reply.attr("type") == Some(IqType::Error.as_str()) {
            let reason = reply
                .get_child("error", ns::CLIENT)
                .and_then(|error| StanzaError::from_element(error).ok())
                .map(|error| error.to_string())
                .unwrap_or_else(|| "unspecified error".to_string());
            return Err(ConnectionError::Bind(reason));
        }

        let bound = reply
            .get_child("bind", ns::BIND)
            .map(Bind::from_element)
            .transpose()
            .map_err(|error| ConnectionError::Bind(error.to_string()))?
            .and_then(|bind| bind.jid);

        // The server-assigned address wins over the one we asked for.
        let jid = match bound {
            Some(jid) => jid,
            None => {
                warn!("server did not return a bound JID");
                self.config.jid.clone()
            }
        };
        debug!(%jid, "resource bound");
        Ok(jid)
    }

    async fn establish_session(
        &self,
        stream: &mut XmppStream,
        early_stanzas: &mut Vec<Element>,
    ) -> Result<(), ConnectionError> {
        let reply = self
            .exchange_iq(stream, "session", Iq::set(None, Session), early_stanzas)
            .await?;
        if reply.attr("type") == Some(IqType::Error.as_str()) {
            let error = reply
                .get_child("error", ns::CLIENT)
                .and_then(|error| StanzaError::from_element(error).ok())
                .unwrap_or_else(StanzaError::service_unavailable);
            return Err(ConnectionError::Stanza(error));
        }
        Ok(())
    }

    async fn enable_stream_management(
        &self,
        stream: &mut XmppStream,
        early_stanzas: &mut Vec<Element>,
    ) -> Result<(), ConnectionError> {
        let Some(request) = self
            .sm()
            .on_stream_started(self.config.stream_management.resume)
        else {
            return Ok(());
        };
        self.send(stream, "stream management", &encode_nonza(request)?)
            .await?;

        loop {
            let element = self.next_element(stream, "stream management").await?;
            let Some(nonza) = decode_nonza(&element) else {
                early_stanzas.push(element);
                continue;
            };
            if !matches!(nonza, Nonza::Enabled(_) | Nonza::Failed(_)) {
                debug!(element = %element, "ignoring stream-management element before <enabled/>");
                continue;
            }
            self.sm().process_nonza(nonza)?;
            return Ok(());
        }
    }
}

enum ResumeOutcome {
    Resumed(Vec<Element>),
    Failed(Vec<Element>),
}
