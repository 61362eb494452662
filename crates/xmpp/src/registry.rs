//! Maps qualified element names to extension decoders.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::element::Element;
use crate::error::DecodeError;
use crate::ns;
use crate::stanza::{
    Bind, Envelope, ExtensionElement, Iq, IqType, Message, MessageType, Ping, Presence,
    PresenceType, RawExtension, Show, Stanza, StanzaError,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub name: String,
    pub namespace: String,
}

impl QualifiedName {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn of(element: &Element) -> Self {
        Self::new(element.name(), element.ns())
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.name)
    }
}

pub trait ExtensionProvider: Send + Sync {
    fn decode(&self, element: &Element) -> Result<Arc<dyn ExtensionElement>, DecodeError>;
}

impl<F> ExtensionProvider for F
where
    F: Fn(&Element) -> Result<Arc<dyn ExtensionElement>, DecodeError> + Send + Sync,
{
    fn decode(&self, element: &Element) -> Result<Arc<dyn ExtensionElement>, DecodeError> {
        self(element)
    }
}

/// Fallback provider that keeps the element untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawProvider;

impl ExtensionProvider for RawProvider {
    fn decode(&self, element: &Element) -> Result<Arc<dyn ExtensionElement>, DecodeError> {
        Ok(Arc::new(RawExtension::new(element.clone())))
    }
}

#[derive(Default)]
pub struct StanzaRegistry {
    providers: DashMap<QualifiedName, Arc<dyn ExtensionProvider>>,
}

impl fmt::Debug for StanzaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StanzaRegistry")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl StanzaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the providers the connection itself depends on.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(QualifiedName::new("bind", ns::BIND), decode_bind);
        registry.register(QualifiedName::new("ping", ns::PING), decode_ping);
        registry
    }

    /// Registers `provider`, replacing and returning any previous one for `name`.
    pub fn register(
        &self,
        name: QualifiedName,
        provider: impl ExtensionProvider + 'static,
    ) -> Option<Arc<dyn ExtensionProvider>> {
        self.providers.insert(name, Arc::new(provider))
    }

    pub fn unregister(&self, name: &QualifiedName) -> Option<Arc<dyn ExtensionProvider>> {
        self.providers.remove(name).map(|(_, provider)| provider)
    }

    pub fn is_registered(&self, name: &QualifiedName) -> bool {
        self.providers.contains_key(name)
    }

    /// Provider for `name`, or the raw pass-through provider.
    pub fn lookup(&self, name: &QualifiedName) -> Arc<dyn ExtensionProvider> {
        self.providers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::new(RawProvider))
    }

    /// Decodes one child element, falling back to a raw extension when the
    /// registered provider rejects it.
    pub fn decode_extension(&self, element: &Element) -> Arc<dyn ExtensionElement> {
        let name = QualifiedName::of(element);
        let provider = self.lookup(&name);
        match provider.decode(element) {
            Ok(extension) => extension,
            Err(error) => {
                warn!(element = %name, %error, "extension provider rejected element");
                Arc::new(RawExtension::new(element.clone()))
            }
        }
    }

    pub fn decode_stanza(&self, element: &Element) -> Result<Stanza, DecodeError> {
        if element.ns() != ns::CLIENT {
            return Err(DecodeError::NotAStanza(element.name().to_string()));
        }

        let mut envelope = Envelope::decode_attributes(element)?;
        let type_attr = element.attr("type");

        let stanza = match element.name() {
            "message" => {
                let mut message = Message::new(parse_type(type_attr, MessageType::from_name)?
                    .unwrap_or(MessageType::Normal));
                for child in element.children() {
                    let slot = match child.name() {
                        "subject" if child.ns() == ns::CLIENT => &mut message.subject,
                        "body" if child.ns() == ns::CLIENT => &mut message.body,
                        "thread" if child.ns() == ns::CLIENT => &mut message.thread,
                        _ => {
                            self.decode_child(child, &mut envelope)?;
                            continue;
                        }
                    };
                    if slot.is_none() {
                        *slot = Some(child.text());
                    } else {
                        envelope.extensions.push(self.decode_extension(child));
                    }
                }
                message.envelope = envelope;
                Stanza::Message(message)
            }
            "presence" => {
                let mut presence = Presence::new(
                    parse_type(type_attr, PresenceType::from_name)?
                        .unwrap_or(PresenceType::Available),
                );
                for child in element.children() {
                    match child.name() {
                        "show" if child.ns() == ns::CLIENT && presence.show.is_none() => {
                            let text = child.text();
                            presence.show = Some(Show::from_name(text.trim()).ok_or_else(|| {
                                DecodeError::InvalidPayload {
                                    element: "show".to_string(),
                                    message: format!("unknown value '{text}'"),
                                }
                            })?);
                        }
                        "status" if child.ns() == ns::CLIENT && presence.status.is_none() => {
                            presence.status = Some(child.text());
                        }
                        "priority" if child.ns() == ns::CLIENT => {
                            let text = child.text();
                            presence.priority =
                                text.trim()
                                    .parse()
                                    .map_err(|_| DecodeError::InvalidPayload {
                                        element: "priority".to_string(),
                                        message: format!("'{text}' is not an integer in -128..=127"),
                                    })?;
                        }
                        _ => self.decode_child(child, &mut envelope)?,
                    }
                }
                presence.envelope = envelope;
                Stanza::Presence(presence)
            }
            "iq" => {
                let iq_type = parse_type(type_attr, IqType::from_name)?
                    .ok_or(DecodeError::MissingAttribute("type"))?;
                if envelope.id.is_none() {
                    return Err(DecodeError::MissingAttribute("id"));
                }
                let mut iq = Iq::new(iq_type);
                for child in element.children() {
                    self.decode_child(child, &mut envelope)?;
                }
                iq.envelope = envelope;
                Stanza::Iq(iq)
            }
            other => return Err(DecodeError::NotAStanza(other.to_string())),
        };

        Ok(stanza)
    }

    fn decode_child(&self, child: &Element, envelope: &mut Envelope) -> Result<(), DecodeError> {
        if child.is("error", ns::CLIENT) && envelope.error.is_none() {
            envelope.error = Some(StanzaError::from_element(child)?);
        } else {
            envelope.extensions.push(self.decode_extension(child));
        }
        Ok(())
    }
}

fn decode_bind(element: &Element) -> Result<Arc<dyn ExtensionElement>, DecodeError> {
    Ok(Arc::new(Bind::from_element(element)?))
}

fn decode_ping(_: &Element) -> Result<Arc<dyn ExtensionElement>, DecodeError> {
    Ok(Arc::new(Ping))
}

fn parse_type<T>(
    value: Option<&str>,
    from_name: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, DecodeError> {
    value
        .map(|raw| {
            from_name(raw).ok_or_else(|| DecodeError::InvalidAttribute {
                attribute: "type",
                value: raw.to_string(),
            })
        })
        .transpose()
}
