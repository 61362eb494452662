//! XML namespaces used on client streams.

pub const CLIENT: &str = "jabber:client";
pub const STREAM: &str = "http://etherx.jabber.org/streams";
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
/// XEP-0198 Stream Management
pub const SM: &str = "urn:xmpp:sm:3";
/// XEP-0199 XMPP Ping
pub const PING: &str = "urn:xmpp:ping";
/// RFC 7395 WebSocket framing
pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
/// XEP-0124 BOSH
pub const HTTPBIND: &str = "http://jabber.org/protocol/httpbind";
/// XEP-0206 XMPP over BOSH
pub const XBOSH: &str = "urn:xmpp:xbosh";
