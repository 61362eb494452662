//! Typed stanzas: `<message/>`, `<presence/>` and `<iq/>`.

mod error;
mod extension;

use std::sync::Arc;

use xmpp_parsers::jid::Jid;

pub use self::error::{StanzaError, StanzaErrorCondition, StanzaErrorType};
pub use self::extension::{Bind, ExtensionElement, Ping, RawExtension, Session};
use crate::element::{Element, ElementBuilder};
use crate::error::DecodeError;
use crate::ns;

macro_rules! attribute_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $value),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

attribute_enum!(MessageType {
    Chat => "chat",
    Error => "error",
    Groupchat => "groupchat",
    Headline => "headline",
    Normal => "normal",
});

attribute_enum!(
    /// Presence `type`; `Available` is expressed by omitting the attribute.
    PresenceType {
        Available => "available",
        Error => "error",
        Probe => "probe",
        Subscribe => "subscribe",
        Subscribed => "subscribed",
        Unavailable => "unavailable",
        Unsubscribe => "unsubscribe",
        Unsubscribed => "unsubscribed",
    }
);

attribute_enum!(Show {
    Away => "away",
    Chat => "chat",
    Dnd => "dnd",
    Xa => "xa",
});

attribute_enum!(IqType {
    Get => "get",
    Set => "set",
    Result => "result",
    Error => "error",
});

impl IqType {
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

/// Addressing and payload shared by all stanza kinds.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub lang: Option<String>,
    pub extensions: Vec<Arc<dyn ExtensionElement>>,
    pub error: Option<StanzaError>,
}

impl Envelope {
    pub(crate) fn decode_attributes(element: &Element) -> Result<Self, DecodeError> {
        Ok(Self {
            id: element.attr("id").map(str::to_string),
            from: parse_jid(element.attr("from"))?,
            to: parse_jid(element.attr("to"))?,
            lang: element.attr("xml:lang").map(str::to_string),
            extensions: Vec::new(),
            error: None,
        })
    }

    pub fn extension<T: ExtensionElement>(&self) -> Option<&T> {
        self.extensions
            .iter()
            .find_map(|extension| extension.downcast_ref::<T>())
    }

    pub fn find_extension(&self, name: &str, namespace: &str) -> Option<&Arc<dyn ExtensionElement>> {
        self.extensions
            .iter()
            .find(|extension| extension.is(name, namespace))
    }

    fn write_attributes(&self, builder: ElementBuilder, type_attr: Option<&str>) -> ElementBuilder {
        builder
            .attr_opt("to", self.to.as_ref().map(|jid| jid.to_string()))
            .attr_opt("from", self.from.as_ref().map(|jid| jid.to_string()))
            .attr_opt("id", self.id.clone())
            .attr_opt("type", type_attr)
            .attr_opt("xml:lang", self.lang.clone())
    }

    fn write_payload(&self, mut builder: ElementBuilder) -> ElementBuilder {
        for extension in &self.extensions {
            builder = builder.append(extension.to_element());
        }
        if let Some(error) = &self.error {
            builder = builder.append(error.to_element());
        }
        builder
    }
}

fn parse_jid(value: Option<&str>) -> Result<Option<Jid>, DecodeError> {
    value
        .map(|raw| {
            raw.parse::<Jid>()
                .map_err(|_| DecodeError::InvalidJid(raw.to_string()))
        })
        .transpose()
}

fn text_child(name: &str, text: &Option<String>) -> Option<Element> {
    text.as_ref()
        .map(|text| Element::builder(name, ns::CLIENT).text(text.clone()).build())
}

#[derive(Debug, Clone)]
pub struct Message {
    pub envelope: Envelope,
    pub message_type: MessageType,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub thread: Option<String>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            envelope: Envelope::default(),
            message_type,
            subject: None,
            body: None,
            thread: None,
        }
    }

    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        let mut message = Self::new(MessageType::Chat);
        message.envelope.to = Some(to);
        message.body = Some(body.into());
        message
    }

    pub fn with_extension(mut self, extension: impl ExtensionElement) -> Self {
        self.envelope.extensions.push(Arc::new(extension));
        self
    }

    fn to_element(&self) -> Element {
        let type_attr = (self.message_type != MessageType::Normal).then(|| self.message_type.as_str());
        let builder = self
            .envelope
            .write_attributes(Element::builder("message", ns::CLIENT), type_attr)
            .append_all(
                [
                    text_child("subject", &self.subject),
                    text_child("body", &self.body),
                    text_child("thread", &self.thread),
                ]
                .into_iter()
                .flatten(),
            );
        self.envelope.write_payload(builder).build()
    }
}

#[derive(Debug, Clone)]
pub struct Presence {
    pub envelope: Envelope,
    pub presence_type: PresenceType,
    pub show: Option<Show>,
    pub status: Option<String>,
    pub priority: i8,
}

impl Presence {
    pub fn new(presence_type: PresenceType) -> Self {
        Self {
            envelope: Envelope::default(),
            presence_type,
            show: None,
            status: None,
            priority: 0,
        }
    }

    pub fn available() -> Self {
        Self::new(PresenceType::Available)
    }

    fn to_element(&self) -> Element {
        let type_attr =
            (self.presence_type != PresenceType::Available).then(|| self.presence_type.as_str());
        let show = self
            .show
            .map(|show| Element::builder("show", ns::CLIENT).text(show.as_str()).build());
        let priority = (self.priority != 0).then(|| {
            Element::builder("priority", ns::CLIENT)
                .text(self.priority.to_string())
                .build()
        });
        let builder = self
            .envelope
            .write_attributes(Element::builder("presence", ns::CLIENT), type_attr)
            .append_all([show, text_child("status", &self.status), priority].into_iter().flatten());
        self.envelope.write_payload(builder).build()
    }
}

#[derive(Debug, Clone)]
pub struct Iq {
    pub envelope: Envelope,
    pub iq_type: IqType,
}

impl Iq {
    pub fn new(iq_type: IqType) -> Self {
        Self {
            envelope: Envelope::default(),
            iq_type,
        }
    }

    pub fn get(to: Option<Jid>, payload: impl ExtensionElement) -> Self {
        Self::request(IqType::Get, to, payload)
    }

    pub fn set(to: Option<Jid>, payload: impl ExtensionElement) -> Self {
        Self::request(IqType::Set, to, payload)
    }

    fn request(iq_type: IqType, to: Option<Jid>, payload: impl ExtensionElement) -> Self {
        let mut iq = Self::new(iq_type);
        iq.envelope.to = to;
        iq.envelope.extensions.push(Arc::new(payload));
        iq
    }

    /// `result` reply addressed back to the sender of `request`.
    pub fn result_for(request: &Iq, payload: Option<Arc<dyn ExtensionElement>>) -> Self {
        let mut iq = Self::new(IqType::Result);
        iq.envelope.id = request.envelope.id.clone();
        iq.envelope.to = request.envelope.from.clone();
        iq.envelope.extensions.extend(payload);
        iq
    }

    /// `error` reply addressed back to the sender of `request`.
    pub fn error_for(request: &Iq, error: StanzaError) -> Self {
        let mut iq = Self::new(IqType::Error);
        iq.envelope.id = request.envelope.id.clone();
        iq.envelope.to = request.envelope.from.clone();
        iq.envelope.extensions = request.envelope.extensions.clone();
        iq.envelope.error = Some(error);
        iq
    }

    pub fn payload(&self) -> Option<&Arc<dyn ExtensionElement>> {
        self.envelope.extensions.first()
    }

    fn to_element(&self) -> Element {
        let builder = self.envelope.write_attributes(
            Element::builder("iq", ns::CLIENT),
            Some(self.iq_type.as_str()),
        );
        self.envelope.write_payload(builder).build()
    }
}

#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    pub fn kind(&self) -> StanzaKind {
        match self {
            Stanza::Message(_) => StanzaKind::Message,
            Stanza::Presence(_) => StanzaKind::Presence,
            Stanza::Iq(_) => StanzaKind::Iq,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Stanza::Message(message) => &message.envelope,
            Stanza::Presence(presence) => &presence.envelope,
            Stanza::Iq(iq) => &iq.envelope,
        }
    }

    pub fn envelope_mut(&mut self) -> &mut Envelope {
        match self {
            Stanza::Message(message) => &mut message.envelope,
            Stanza::Presence(presence) => &mut presence.envelope,
            Stanza::Iq(iq) => &mut iq.envelope,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.envelope().id.as_deref()
    }

    pub fn from(&self) -> Option<&Jid> {
        self.envelope().from.as_ref()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.envelope().to.as_ref()
    }

    pub fn error(&self) -> Option<&StanzaError> {
        self.envelope().error.as_ref()
    }

    pub fn is_error(&self) -> bool {
        match self {
            Stanza::Message(message) => message.message_type == MessageType::Error,
            Stanza::Presence(presence) => presence.presence_type == PresenceType::Error,
            Stanza::Iq(iq) => iq.iq_type == IqType::Error,
        }
    }

    pub fn as_iq(&self) -> Option<&Iq> {
        match self {
            Stanza::Iq(iq) => Some(iq),
            _ => None,
        }
    }

    /// Assigns a fresh id if the stanza has none and returns it.
    pub fn ensure_id(&mut self) -> &str {
        let envelope = self.envelope_mut();
        envelope
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .as_str()
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(message) => message.to_element(),
            Stanza::Presence(presence) => presence.to_element(),
            Stanza::Iq(iq) => iq.to_element(),
        }
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(message)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_serializes_in_client_namespace() {
        let mut stanza: Stanza =
            Message::chat("romeo@example.net".parse().expect("valid JID"), "Art thou not Romeo?").into();
        stanza.envelope_mut().id = Some("m1".to_string());

        assert_eq!(
            stanza.to_element().to_xml_in(ns::CLIENT),
            "<message to='romeo@example.net' id='m1' type='chat'><body>Art thou not Romeo?</body></message>"
        );
    }

    #[test]
    fn ensure_id_is_stable_once_assigned() {
        let mut stanza: Stanza = Presence::available().into();
        let first = stanza.ensure_id().to_string();
        assert!(!first.is_empty());
        assert_eq!(stanza.ensure_id(), first);
    }

    #[test]
    fn iq_replies_swap_addressing() {
        let mut request = Iq::get(None, Ping);
        request.envelope.id = Some("p1".to_string());
        request.envelope.from = Some("example.com".parse().expect("valid JID"));

        let result = Iq::result_for(&request, None);
        assert_eq!(result.iq_type, IqType::Result);
        assert_eq!(result.envelope.id.as_deref(), Some("p1"));
        assert_eq!(
            result.envelope.to.as_ref().map(|jid| jid.to_string()).as_deref(),
            Some("example.com")
        );

        let error = Iq::error_for(&request, StanzaError::service_unavailable());
        assert_eq!(
            <Stanza as From<_>>::from(error).to_element().to_xml_in(ns::CLIENT),
            "<iq to='example.com' id='p1' type='error'><ping xmlns='urn:xmpp:ping'/><error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
        );
    }

    #[test]
    fn presence_omits_defaults() {
        let mut presence = Presence::available();
        presence.show = Some(Show::Away);
        assert_eq!(
            <Stanza as From<_>>::from(presence).to_element().to_xml_in(ns::CLIENT),
            "<presence><show>away</show></presence>"
        );
    }
}
