//! XMPP client core: stream codec, negotiation, stanza routing and the
//! connection lifecycle over TCP, direct TLS, WebSocket and BOSH.

pub mod codec;
pub mod collector;
pub mod config;
pub mod connection;
pub mod element;
pub mod error;
pub mod features;
pub mod filter;
pub mod iq_handler;
mod negotiation;
pub mod ns;
pub mod reconnect;
pub mod registry;
pub mod router;
pub mod sasl;
pub mod session;
pub mod stanza;
pub mod state;
pub mod stream_management;
pub mod transport;

pub use codec::{Packet, StreamEvent, StreamHeader, XmlStreamCodec, XmppCodec};
pub use collector::{CollectorConfig, ReplyCollector};
pub use config::{Config, ConfigError, ConnectionConfig, TlsPolicy, TransportKind};
pub use connection::{ConnectionEvent, XmppConnection};
pub use element::Element;
pub use error::{CodecError, ConnectionError, DecodeError};
pub use filter::{IqReplyFilter, StanzaFilter};
pub use iq_handler::{IqHandlers, IqRequestHandler, UnknownIqReply};
pub use reconnect::{BackoffStrategy, ReconnectPolicy};
pub use registry::{ExtensionProvider, QualifiedName, StanzaRegistry};
pub use router::{AsyncStanzaListener, ListenerId, StanzaInterceptor, StanzaListener, StanzaRouter};
pub use sasl::{MechanismSet, SaslMechanism, SelectedMechanism};
pub use session::{StreamManagementInfo, StreamSessionContext};
pub use stanza::{Iq, IqType, Message, MessageType, Presence, PresenceType, Stanza, StanzaError};
pub use state::ConnectionState;
pub use stream_management::{StreamManagementAction, StreamManagementState, StreamManager};
pub use transport::{DefaultConnector, Transport, TransportConnector};
pub use xmpp_parsers::jid::Jid;
