use std::time::Duration;

use xmpp_parsers::jid::Jid;

/// What a successful negotiation established. Replaced on every reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSessionContext {
    /// Full JID bound (or resumed) for this session.
    pub jid: Jid,
    pub stream_id: Option<String>,
    /// `name namespace` of every feature advertised after authentication.
    pub features: Vec<String>,
    /// `None` when the session was resumed without a fresh SASL exchange.
    pub mechanism: Option<String>,
    pub encrypted: bool,
    pub stream_management: Option<StreamManagementInfo>,
}

impl StreamSessionContext {
    pub fn has_feature(&self, name: &str, namespace: &str) -> bool {
        let identifier = format!("{name} {namespace}");
        self.features.iter().any(|feature| *feature == identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamManagementInfo {
    pub id: Option<String>,
    pub resumable: bool,
    /// Smaller of the client's and the server's maximum resumption time.
    pub resumption_window: Option<Duration>,
    pub resumed: bool,
}
