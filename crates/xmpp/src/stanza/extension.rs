use std::any::Any;
use std::fmt;

use xmpp_parsers::jid::Jid;

use crate::element::Element;
use crate::error::DecodeError;
use crate::ns;

/// A typed child of a stanza, identified by element name and namespace.
pub trait ExtensionElement: fmt::Debug + Send + Sync + 'static {
    fn element_name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn to_element(&self) -> Element;
    fn as_any(&self) -> &dyn Any;
}

impl dyn ExtensionElement {
    pub fn downcast_ref<T: ExtensionElement>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.element_name() == name && self.namespace() == namespace
    }
}

/// Pass-through for extensions no provider understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExtension {
    element: Element,
}

impl RawExtension {
    pub fn new(element: Element) -> Self {
        Self { element }
    }

    pub fn element(&self) -> &Element {
        &self.element
    }
}

impl ExtensionElement for RawExtension {
    fn element_name(&self) -> &str {
        self.element.name()
    }

    fn namespace(&self) -> &str {
        self.element.ns()
    }

    fn to_element(&self) -> Element {
        self.element.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Resource binding payload (RFC 6120 §7).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bind {
    pub resource: Option<String>,
    pub jid: Option<Jid>,
}

impl Bind {
    pub fn request(resource: Option<String>) -> Self {
        Self {
            resource,
            jid: None,
        }
    }

    pub fn from_element(element: &Element) -> Result<Self, DecodeError> {
        let resource = element
            .get_child("resource", ns::BIND)
            .map(|child| child.text().trim().to_string())
            .filter(|resource| !resource.is_empty());
        let jid = element
            .get_child("jid", ns::BIND)
            .map(|child| {
                let text = child.text();
                text.trim()
                    .parse::<Jid>()
                    .map_err(|_| DecodeError::InvalidJid(text.clone()))
            })
            .transpose()?;
        Ok(Self { resource, jid })
    }
}

impl ExtensionElement for Bind {
    fn element_name(&self) -> &str {
        "bind"
    }

    fn namespace(&self) -> &str {
        ns::BIND
    }

    fn to_element(&self) -> Element {
        let mut element = Element::new("bind", ns::BIND);
        if let Some(resource) = &self.resource {
            element.append_child(Element::builder("resource", ns::BIND).text(resource.clone()).build());
        }
        if let Some(jid) = &self.jid {
            element.append_child(Element::builder("jid", ns::BIND).text(jid.to_string()).build());
        }
        element
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// XEP-0199 ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping;

impl ExtensionElement for Ping {
    fn element_name(&self) -> &str {
        "ping"
    }

    fn namespace(&self) -> &str {
        ns::PING
    }

    fn to_element(&self) -> Element {
        Element::new("ping", ns::PING)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Legacy session establishment request (RFC 3921 §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Session;

impl ExtensionElement for Session {
    fn element_name(&self) -> &str {
        "session"
    }

    fn namespace(&self) -> &str {
        ns::SESSION
    }

    fn to_element(&self) -> Element {
        Element::new("session", ns::SESSION)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
