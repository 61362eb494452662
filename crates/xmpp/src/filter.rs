//! Predicates selecting which stanzas a collector or listener receives.

use xmpp_parsers::jid::Jid;

use crate::stanza::{IqType, Stanza, StanzaKind};

pub trait StanzaFilter: Send + Sync {
    fn accept(&self, stanza: &Stanza) -> bool;
}

impl<F> StanzaFilter for F
where
    F: Fn(&Stanza) -> bool + Send + Sync,
{
    fn accept(&self, stanza: &Stanza) -> bool {
        self(stanza)
    }
}

/// Accepts every stanza.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl StanzaFilter for AcceptAll {
    fn accept(&self, _: &Stanza) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct StanzaIdFilter {
    id: String,
}

impl StanzaIdFilter {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl StanzaFilter for StanzaIdFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.id() == Some(self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StanzaKindFilter(pub StanzaKind);

impl StanzaFilter for StanzaKindFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.kind() == self.0
    }
}

/// Accepts stanzas carrying an extension with the given name and namespace.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    name: String,
    namespace: String,
}

impl ExtensionFilter {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl StanzaFilter for ExtensionFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza
            .envelope()
            .find_extension(&self.name, &self.namespace)
            .is_some()
    }
}

#[derive(Debug, Clone)]
pub struct FromMatchesFilter {
    address: Jid,
    ignore_resource: bool,
}

impl FromMatchesFilter {
    pub fn full(address: Jid) -> Self {
        Self {
            address,
            ignore_resource: false,
        }
    }

    pub fn bare(address: Jid) -> Self {
        Self {
            address,
            ignore_resource: true,
        }
    }
}

impl StanzaFilter for FromMatchesFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        match stanza.from() {
            Some(from) if self.ignore_resource => from.to_bare() == self.address.to_bare(),
            Some(from) => *from == self.address,
            None => false,
        }
    }
}

/// Matches the `result` or `error` answering one IQ request.
///
/// A reply must carry the request's id and come from the entity the request
/// was addressed to. Requests without `to` are answered by the user's own
/// server, which may reply with no `from`, the account's bare JID, or the
/// server domain.
#[derive(Debug, Clone)]
pub struct IqReplyFilter {
    id: String,
    accepted_senders: Vec<String>,
    accept_missing_from: bool,
}

impl IqReplyFilter {
    pub fn new(id: impl Into<String>, to: Option<&Jid>, local: Option<&Jid>) -> Self {
        let local_bare = local.map(|jid| jid.to_bare().to_string());
        let local_domain = local.map(|jid| jid.domain().to_string());
        let local_full = local.map(|jid| jid.to_string());

        let (accepted_senders, accept_missing_from) = match to {
            Some(to) => {
                let to = to.to_string();
                let to_self = Some(&to) == local_bare.as_ref()
                    || Some(&to) == local_full.as_ref()
                    || Some(&to) == local_domain.as_ref();
                (vec![to], to_self)
            }
            None => (
                [local_bare, local_domain, local_full]
                    .into_iter()
                    .flatten()
                    .collect(),
                true,
            ),
        };

        Self {
            id: id.into(),
            accepted_senders,
            accept_missing_from,
        }
    }
}

impl StanzaFilter for IqReplyFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        if !matches!(iq.iq_type, IqType::Result | IqType::Error) {
            return false;
        }
        if iq.envelope.id.as_deref() != Some(self.id.as_str()) {
            return false;
        }

        match &iq.envelope.from {
            None => self.accept_missing_from,
            Some(from) => {
                let from = from.to_string();
                self.accepted_senders.iter().any(|sender| *sender == from)
            }
        }
    }
}

pub struct AndFilter(Vec<Box<dyn StanzaFilter>>);

impl AndFilter {
    pub fn new(filters: Vec<Box<dyn StanzaFilter>>) -> Self {
        Self(filters)
    }
}

impl StanzaFilter for AndFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.0.iter().all(|filter| filter.accept(stanza))
    }
}

pub struct OrFilter(Vec<Box<dyn StanzaFilter>>);

impl OrFilter {
    pub fn new(filters: Vec<Box<dyn StanzaFilter>>) -> Self {
        Self(filters)
    }
}

impl StanzaFilter for OrFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.0.iter().any(|filter| filter.accept(stanza))
    }
}

pub struct NotFilter(Box<dyn StanzaFilter>);

impl NotFilter {
    pub fn new(filter: impl StanzaFilter + 'static) -> Self {
        Self(Box::new(filter))
    }
}

impl StanzaFilter for NotFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        !self.0.accept(stanza)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Iq, Message, MessageType, Ping};

    fn jid(value: &str) -> Jid {
        value.parse().expect("valid test JID")
    }

    fn reply(id: &str, from: Option<&str>, iq_type: IqType) -> Stanza {
        let mut iq = Iq::new(iq_type);
        iq.envelope.id = Some(id.to_string());
        iq.envelope.from = from.map(jid);
        iq.into()
    }

    #[test]
    fn iq_reply_filter_requires_matching_sender() {
        let local = jid("juliet@example.com/balcony");
        let filter = IqReplyFilter::new("q1", Some(&jid("pubsub.example.com")), Some(&local));

        assert!(filter.accept(&reply("q1", Some("pubsub.example.com"), IqType::Result)));
        assert!(filter.accept(&reply("q1", Some("pubsub.example.com"), IqType::Error)));
        assert!(!filter.accept(&reply("q1", Some("evil.example.org"), IqType::Result)));
        assert!(!filter.accept(&reply("q1", None, IqType::Result)));
        assert!(!filter.accept(&reply("q2", Some("pubsub.example.com"), IqType::Result)));
        assert!(!filter.accept(&reply("q1", Some("pubsub.example.com"), IqType::Get)));
    }

    #[test]
    fn iq_reply_filter_accepts_own_server_for_unaddressed_requests() {
        let local = jid("juliet@example.com/balcony");
        let filter = IqReplyFilter::new("q1", None, Some(&local));

        assert!(filter.accept(&reply("q1", None, IqType::Result)));
        assert!(filter.accept(&reply("q1", Some("example.com"), IqType::Result)));
        assert!(filter.accept(&reply("q1", Some("juliet@example.com"), IqType::Result)));
        assert!(!filter.accept(&reply("q1", Some("romeo@example.net"), IqType::Result)));
    }

    #[test]
    fn combinators_compose() {
        let chat_from_romeo = AndFilter::new(vec![
            Box::new(StanzaKindFilter(StanzaKind::Message)),
            Box::new(FromMatchesFilter::bare(jid("romeo@example.net"))),
        ]);

        let mut message = Message::new(MessageType::Chat);
        message.envelope.from = Some(jid("romeo@example.net/orchard"));
        let message: Stanza = message.into();

        assert!(chat_from_romeo.accept(&message));
        assert!(!NotFilter::new(StanzaKindFilter(StanzaKind::Message)).accept(&message));

        let ping: Stanza = Iq::get(None, Ping).into();
        let either = OrFilter::new(vec![
            Box::new(ExtensionFilter::new("ping", crate::ns::PING)),
            Box::new(|stanza: &Stanza| stanza.is_error()),
        ]);
        assert!(either.accept(&ping));
        assert!(!either.accept(&message));
    }
}
