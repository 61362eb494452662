//! `<stream:features/>` as advertised after each stream (re)start.

use std::collections::HashSet;

use crate::element::Element;
use crate::ns;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    /// `Some(required)` when StartTLS is offered.
    pub starttls: Option<bool>,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// `Some(optional)` when legacy session establishment is advertised.
    pub session: Option<bool>,
    pub stream_management: bool,
    pub other: Vec<(String, String)>,
}

impl StreamFeatures {
    pub fn from_element(element: &Element) -> Self {
        let mut features = StreamFeatures::default();

        for child in element.children() {
            match (child.name(), child.ns()) {
                ("starttls", ns::TLS) => {
                    features.starttls = Some(child.has_child("required", ns::TLS));
                }
                ("mechanisms", ns::SASL) => {
                    features.mechanisms = child
                        .children()
                        .filter(|mechanism| mechanism.is("mechanism", ns::SASL))
                        .map(|mechanism| mechanism.text().trim().to_string())
                        .filter(|mechanism| !mechanism.is_empty())
                        .collect();
                }
                ("bind", ns::BIND) => features.bind = true,
                ("session", ns::SESSION) => {
                    features.session = Some(child.has_child("optional", ns::SESSION));
                }
                ("sm", ns::SM) => features.stream_management = true,
                (name, namespace) => features
                    .other
                    .push((name.to_string(), namespace.to_string())),
            }
        }

        features
    }

    pub fn starttls_required(&self) -> bool {
        self.starttls == Some(true)
    }

    pub fn offered_mechanisms(&self) -> HashSet<String> {
        self.mechanisms.iter().cloned().collect()
    }

    /// Session establishment is only performed when the server requires it.
    pub fn session_required(&self) -> bool {
        self.session == Some(false)
    }

    /// `name namespace` pairs for everything advertised.
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers = Vec::new();
        if self.starttls.is_some() {
            identifiers.push(format!("starttls {}", ns::TLS));
        }
        if !self.mechanisms.is_empty() {
            identifiers.push(format!("mechanisms {}", ns::SASL));
        }
        if self.bind {
            identifiers.push(format!("bind {}", ns::BIND));
        }
        if self.session.is_some() {
            identifiers.push(format!("session {}", ns::SESSION));
        }
        if self.stream_management {
            identifiers.push(format!("sm {}", ns::SM));
        }
        identifiers.extend(
            self.other
                .iter()
                .map(|(name, namespace)| format!("{name} {namespace}")),
        );
        identifiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> StreamFeatures {
        StreamFeatures::from_element(&Element::parse(xml).expect("features should parse"))
    }

    #[test]
    fn parses_pre_tls_features() {
        let features = parse(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism>\
             </mechanisms></stream:features>",
        );

        assert!(features.starttls_required());
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-1", "PLAIN"]);
        assert!(!features.bind);
    }

    #[test]
    fn parses_post_auth_features() {
        let features = parse(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>\
             <sm xmlns='urn:xmpp:sm:3'/>\
             <csi xmlns='urn:xmpp:csi:0'/></stream:features>",
        );

        assert!(features.bind);
        assert!(features.stream_management);
        assert!(!features.session_required());
        assert_eq!(features.starttls, None);
        assert!(features.identifiers().contains(&"csi urn:xmpp:csi:0".to_string()));
        assert!(features.identifiers().contains(&"sm urn:xmpp:sm:3".to_string()));
    }

    #[test]
    fn session_without_optional_is_required() {
        let features = parse(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></stream:features>",
        );
        assert!(features.session_required());
    }
}
