//! XEP-0198 Stream Management: ack counters, unacked outbound queue and
//! resumption bookkeeping.

use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use xmpp_parsers::sm::{A, Enable, Nonza, R, Resume};

use crate::config::DEFAULT_MAX_UNACKED_STANZAS;
use crate::element::Element;
use crate::error::ConnectionError;
use crate::ns;
use crate::session::StreamManagementInfo;

/// Share of the unacked cap, in percent, that triggers an `<r/>` once reached.
pub const ACK_REQUEST_HIGH_WATER_PERCENT: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamManagementState {
    #[default]
    Disabled,
    Enabling,
    Enabled,
    Resuming,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamManagementAction {
    SendNonza(Nonza),
    /// Stanzas the server never acknowledged, oldest first.
    ReplayStanzas(Vec<Element>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamManagementCounters {
    pub inbound_handled: u32,
    pub last_acked_by_server: u32,
    pub unacked: usize,
}

#[derive(Debug)]
pub struct StreamManager {
    state: StreamManagementState,
    inbound_handled: u32,
    last_acked_by_server: u32,
    resume_supported: bool,
    stream_id: Option<xmpp_parsers::sm::StreamId>,
    client_max_resumption: Option<Duration>,
    server_max_resumption: Option<Duration>,
    detached_at: Option<Instant>,
    ack_requested: bool,
    unacked_stanzas: VecDeque<Element>,
    max_unacked: usize,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self {
            state: StreamManagementState::default(),
            inbound_handled: 0,
            last_acked_by_server: 0,
            resume_supported: false,
            stream_id: None,
            client_max_resumption: None,
            server_max_resumption: None,
            detached_at: None,
            ack_requested: false,
            unacked_stanzas: VecDeque::new(),
            max_unacked: DEFAULT_MAX_UNACKED_STANZAS,
        }
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_resumption(max_resumption: Option<Duration>) -> Self {
        Self {
            client_max_resumption: max_resumption,
            ..Self::default()
        }
    }

    pub fn with_max_unacked(mut self, max_unacked: usize) -> Self {
        self.max_unacked = max_unacked.max(1);
        self
    }

    /// Unacked stanzas at which an `<r/>` is sent without waiting for the cap.
    pub fn ack_request_threshold(&self) -> usize {
        (self.max_unacked * ACK_REQUEST_HIGH_WATER_PERCENT / 100).max(1)
    }

    /// Whether the next stanza has to wait for the server to acknowledge
    /// earlier ones.
    pub fn is_unacked_queue_full(&self) -> bool {
        self.is_tracking() && self.unacked_stanzas.len() >= self.max_unacked
    }

    pub fn state(&self) -> StreamManagementState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, StreamManagementState::Enabled)
    }

    pub fn counters(&self) -> StreamManagementCounters {
        StreamManagementCounters {
            inbound_handled: self.inbound_handled,
            last_acked_by_server: self.last_acked_by_server,
            unacked: self.unacked_stanzas.len(),
        }
    }

    pub fn info(&self, resumed: bool) -> StreamManagementInfo {
        StreamManagementInfo {
            id: self.stream_id.as_ref().map(|id| id.0.clone()),
            resumable: self.resume_supported,
            resumption_window: self.resumption_window(),
            resumed,
        }
    }

    /// `min(client max, server max)` of whichever limits are known.
    pub fn resumption_window(&self) -> Option<Duration> {
        match (self.client_max_resumption, self.server_max_resumption) {
            (Some(client), Some(server)) => Some(client.min(server)),
            (client, server) => client.or(server),
        }
    }

    /// `<resume/>` if a previous session can still be resumed, otherwise
    /// `<enable/>`.
    pub fn on_stream_started(&mut self, request_resumption: bool) -> Option<Nonza> {
        if matches!(self.state, StreamManagementState::Resuming) {
            if let Some(stream_id) = self.stream_id.clone().filter(|_| self.is_resumable()) {
                return Some(Nonza::Resume(Resume {
                    h: self.inbound_handled,
                    previd: stream_id,
                }));
            }
            debug!("previous session outside its resumption window");
            self.reset_session();
        }

        if matches!(self.state, StreamManagementState::Disabled) {
            self.state = StreamManagementState::Enabling;
            let enable = Enable::new();
            let enable = if request_resumption {
                enable.with_resume()
            } else {
                enable
            };
            return Some(Nonza::Enable(enable));
        }

        None
    }

    pub fn on_connect_attempt_failed(&mut self) {
        if matches!(self.state, StreamManagementState::Enabling) {
            self.state = StreamManagementState::Disabled;
        }
    }

    /// Keeps the session for resumption after an unexpected disconnect.
    pub fn prepare_for_reconnect(&mut self) {
        if self.resume_supported && self.stream_id.is_some() {
            self.state = StreamManagementState::Resuming;
            self.detached_at = Some(Instant::now());
            self.ack_requested = false;
        } else {
            self.reset();
        }
    }

    pub fn can_resume(&self) -> bool {
        matches!(self.state, StreamManagementState::Resuming) && self.is_resumable()
    }

    pub fn reset(&mut self) {
        self.reset_session();
        self.unacked_stanzas.clear();
    }

    /// Gives up on a session that cannot be resumed and hands back the
    /// stanzas it never got acknowledged, oldest first.
    pub fn abandon_resumption(&mut self) -> Vec<Element> {
        if !matches!(self.state, StreamManagementState::Resuming) {
            return Vec::new();
        }
        let pending = self.unacked_stanzas.drain(..).collect();
        self.reset_session();
        pending
    }

    fn reset_session(&mut self) {
        self.state = StreamManagementState::Disabled;
        self.inbound_handled = 0;
        self.last_acked_by_server = 0;
        self.resume_supported = false;
        self.stream_id = None;
        self.server_max_resumption = None;
        self.detached_at = None;
        self.ack_requested = false;
    }

    fn is_tracking(&self) -> bool {
        matches!(
            self.state,
            StreamManagementState::Enabled | StreamManagementState::Resuming
        )
    }

    pub fn mark_inbound_handled(&mut self) {
        if self.is_tracking() {
            self.inbound_handled = self.inbound_handled.wrapping_add(1);
        }
    }

    /// Queues a sent stanza until the server acknowledges it. Returns `true`
    /// when an ack request should follow.
    pub fn track_outbound_stanza(&mut self, stanza: &Element) -> bool {
        if !self.is_tracking() {
            return false;
        }

        self.unacked_stanzas.push_back(stanza.clone());
        if self.unacked_stanzas.len() >= self.ack_request_threshold() && !self.ack_requested {
            self.ack_requested = true;
            return true;
        }
        false
    }

    pub fn ack_request(&mut self) -> Option<Nonza> {
        if !self.is_enabled() {
            return None;
        }
        self.ack_requested = true;
        Some(Nonza::Req(R))
    }

    /// `<r/>` unless one is already outstanding.
    pub fn pending_ack_request(&mut self) -> Option<Nonza> {
        if self.ack_requested {
            return None;
        }
        self.ack_request()
    }

    pub fn process_nonza(
        &mut self,
        nonza: Nonza,
    ) -> Result<Vec<StreamManagementAction>, ConnectionError> {
        match nonza {
            Nonza::Enabled(enabled) => {
                self.state = StreamManagementState::Enabled;
                self.resume_supported = enabled.resume;
                self.stream_id = if enabled.resume { enabled.id } else { None };
                self.server_max_resumption = enabled.max.map(|max| Duration::from_secs(max.into()));
                Ok(Vec::new())
            }
            Nonza::Ack(ack) => {
                self.apply_ack(ack.h)?;
                Ok(Vec::new())
            }
            Nonza::Req(_) => Ok(vec![StreamManagementAction::SendNonza(Nonza::Ack(A::new(
                self.inbound_handled,
            )))]),
            Nonza::Resumed(resumed) => {
                let expected_id = self.stream_id.as_ref().ok_or_else(|| {
                    ConnectionError::ProtocolViolation(
                        "received <resumed/> without a tracked stream id".to_string(),
                    )
                })?;

                if resumed.previd != *expected_id {
                    return Err(ConnectionError::ProtocolViolation(format!(
                        "received <resumed/> for unexpected stream id '{}'",
                        resumed.previd.0
                    )));
                }

                self.apply_ack(resumed.h)?;
                self.state = StreamManagementState::Enabled;
                self.detached_at = None;
                Ok(vec![StreamManagementAction::ReplayStanzas(
                    self.unacked_stanzas.iter().cloned().collect(),
                )])
            }
            Nonza::Failed(failed) => {
                let was_resuming = matches!(self.state, StreamManagementState::Resuming);
                if let Some(handled) = failed.h {
                    self.apply_ack(handled)?;
                }
                let pending: Vec<Element> = self.unacked_stanzas.drain(..).collect();
                self.reset_session();

                if was_resuming {
                    debug!(pending = pending.len(), "resumption refused, stanzas will be resent");
                    Ok(vec![StreamManagementAction::ReplayStanzas(pending)])
                } else {
                    warn!("server refused to enable stream management");
                    Ok(Vec::new())
                }
            }
            Nonza::Enable(_) | Nonza::Resume(_) => Err(ConnectionError::ProtocolViolation(
                "received unexpected client stream-management nonza from server".to_string(),
            )),
        }
    }

    fn is_resumable(&self) -> bool {
        if !self.resume_supported || self.stream_id.is_none() {
            return false;
        }
        match (self.detached_at, self.resumption_window()) {
            (Some(detached_at), Some(window)) => detached_at.elapsed() < window,
            _ => true,
        }
    }

    fn apply_ack(&mut self, handled: u32) -> Result<(), ConnectionError> {
        let newly_acked = handled.wrapping_sub(self.last_acked_by_server) as usize;
        if newly_acked > self.unacked_stanzas.len() {
            return Err(ConnectionError::ProtocolViolation(format!(
                "server acknowledged {newly_acked} stanza(s), but only {} are pending",
                self.unacked_stanzas.len()
            )));
        }

        self.unacked_stanzas.drain(..newly_acked);
        self.last_acked_by_server = handled;
        self.ack_requested = false;
        Ok(())
    }
}

/// Stream management element in the `urn:xmpp:sm:3` namespace, if `element` is one.
pub fn decode_nonza(element: &Element) -> Option<Nonza> {
    if element.ns() != ns::SM {
        return None;
    }

    let parsed = xmpp_parsers::minidom::Element::from_str(&element.to_xml()).ok()?;
    Nonza::try_from(parsed).ok()
}

pub fn encode_nonza(nonza: Nonza) -> Result<Element, ConnectionError> {
    let element: xmpp_parsers::minidom::Element = nonza.into();
    let mut payload = Vec::new();
    element.write_to(&mut payload).map_err(|error| {
        ConnectionError::ProtocolViolation(format!(
            "failed to serialize stream-management nonza: {error}"
        ))
    })?;
    let xml = String::from_utf8(payload).map_err(|error| {
        ConnectionError::ProtocolViolation(format!("stream-management nonza is not UTF-8: {error}"))
    })?;
    Ok(Element::parse(&xml)?)
}
