use std::fmt;

use crate::element::Element;
use crate::error::DecodeError;
use crate::ns;

/// Error type attribute of a stanza `<error/>` (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (the error cannot be remedied)
    Cancel,
    /// Proceed (the condition was only a warning)
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (the error is temporary)
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "auth" => Self::Auth,
            "cancel" => Self::Cancel,
            "continue" => Self::Continue,
            "modify" => Self::Modify,
            "wait" => Self::Wait,
            _ => return None,
        })
    }
}

/// Defined stanza error conditions (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    const ALL: [StanzaErrorCondition; 22] = [
        Self::BadRequest,
        Self::Conflict,
        Self::FeatureNotImplemented,
        Self::Forbidden,
        Self::Gone,
        Self::InternalServerError,
        Self::ItemNotFound,
        Self::JidMalformed,
        Self::NotAcceptable,
        Self::NotAllowed,
        Self::NotAuthorized,
        Self::PolicyViolation,
        Self::RecipientUnavailable,
        Self::Redirect,
        Self::RegistrationRequired,
        Self::RemoteServerNotFound,
        Self::RemoteServerTimeout,
        Self::ResourceConstraint,
        Self::ServiceUnavailable,
        Self::SubscriptionRequired,
        Self::UndefinedCondition,
        Self::UnexpectedRequest,
    ];

    /// Element name of this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|condition| condition.as_str() == name)
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub error_type: StanzaErrorType,
    pub condition: StanzaErrorCondition,
    pub text: Option<String>,
    pub by: Option<String>,
}

impl StanzaError {
    pub fn new(error_type: StanzaErrorType, condition: StanzaErrorCondition) -> Self {
        Self {
            error_type,
            condition,
            text: None,
            by: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn service_unavailable() -> Self {
        Self::new(
            StanzaErrorType::Cancel,
            StanzaErrorCondition::ServiceUnavailable,
        )
    }

    pub fn feature_not_implemented() -> Self {
        Self::new(
            StanzaErrorType::Cancel,
            StanzaErrorCondition::FeatureNotImplemented,
        )
    }

    pub fn from_element(element: &Element) -> Result<Self, DecodeError> {
        let type_attr = element
            .attr("type")
            .ok_or(DecodeError::MissingAttribute("type"))?;
        let error_type =
            StanzaErrorType::from_name(type_attr).ok_or_else(|| DecodeError::InvalidAttribute {
                attribute: "type",
                value: type_attr.to_string(),
            })?;

        let mut condition = None;
        let mut text = None;
        for child in element.children().filter(|child| child.ns() == ns::STANZAS) {
            if child.name() == "text" {
                text = Some(child.text());
            } else if condition.is_none() {
                condition = StanzaErrorCondition::from_name(child.name());
            }
        }

        Ok(Self {
            error_type,
            condition: condition.unwrap_or(StanzaErrorCondition::UndefinedCondition),
            text,
            by: element.attr("by").map(str::to_string),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::CLIENT)
            .attr("type", self.error_type.as_str())
            .attr_opt("by", self.by.clone())
            .append(Element::new(self.condition.as_str(), ns::STANZAS));
        if let Some(text) = &self.text {
            builder = builder.append(Element::builder("text", ns::STANZAS).text(text.clone()).build());
        }
        builder.build()
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition.as_str(), self.error_type.as_str())?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_condition_and_text() {
        let element = Element::parse(
            "<error xmlns='jabber:client' type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>no such node</text></error>",
        )
        .expect("error element should parse");

        let error = StanzaError::from_element(&element).expect("error should decode");
        assert_eq!(error.error_type, StanzaErrorType::Cancel);
        assert_eq!(error.condition, StanzaErrorCondition::ItemNotFound);
        assert_eq!(error.text.as_deref(), Some("no such node"));
        assert_eq!(error.to_string(), "item-not-found (cancel): no such node");
    }

    #[test]
    fn unknown_condition_becomes_undefined() {
        let element = Element::parse(
            "<error type='wait'><made-up xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>",
        )
        .expect("error element should parse");
        let error = StanzaError::from_element(&element).expect("error should decode");
        assert_eq!(error.condition, StanzaErrorCondition::UndefinedCondition);
    }

    #[test]
    fn missing_type_is_a_decode_error() {
        let element = Element::parse("<error/>").expect("element should parse");
        assert_eq!(
            StanzaError::from_element(&element),
            Err(DecodeError::MissingAttribute("type"))
        );
    }

    #[test]
    fn serializes_condition_in_stanzas_namespace() {
        let error = StanzaError::service_unavailable();
        assert_eq!(
            error.to_element().to_xml_in(ns::CLIENT),
            "<error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>"
        );
    }
}
