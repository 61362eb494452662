use std::fmt;

use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Initial,
    Connecting,
    StreamOpened,
    TlsNegotiating,
    Authenticating,
    ResourceBinding,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Initial => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::StreamOpened => 2,
            ConnectionState::TlsNegotiating => 3,
            ConnectionState::Authenticating => 4,
            ConnectionState::ResourceBinding => 5,
            ConnectionState::Connected => 6,
            ConnectionState::Disconnected | ConnectionState::Failed => 7,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// Negotiation only moves forward; a stream restart re-enters
    /// `StreamOpened`, and any state may drop to `Disconnected`/`Failed`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected | Failed) => true,
            (Initial | Connected | Disconnected | Failed, Connecting) => true,
            (TlsNegotiating | Authenticating, StreamOpened) => true,
            (from, _) if from.is_terminal() || from == Initial => false,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initial => "initial",
            ConnectionState::Connecting => "connecting",
            ConnectionState::StreamOpened => "stream-opened",
            ConnectionState::TlsNegotiating => "tls-negotiating",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::ResourceBinding => "resource-binding",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Current connection state, observable through `watch` receivers.
#[derive(Debug)]
pub struct StateCell {
    sender: watch::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            sender: watch::Sender::new(ConnectionState::Initial),
        }
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.sender.subscribe()
    }

    /// Applies `next` if the transition is valid and returns the previous state.
    pub fn transition(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut previous = None;
        self.sender.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(from = %current, to = %next, "rejected connection state transition");
                return false;
            }
            debug!(from = %current, to = %next, "connection state changed");
            previous = Some(*current);
            *current = next;
            true
        });
        previous
    }
}
