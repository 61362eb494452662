use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use base64::prelude::*;
use sasl::client::Mechanism;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};

use crate::element::Element;
use crate::error::ConnectionError;
use crate::ns;

/// One side of a SASL exchange, driven by the negotiation loop.
pub trait SaslMechanism: Send {
    fn name(&self) -> &str;

    /// `None` when the mechanism has no initial response.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ConnectionError>;

    /// Checks the additional data carried by `<success/>`.
    fn verify_success(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    fn is_complete(&self) -> bool;

    fn negotiated_qop(&self) -> Option<&str> {
        None
    }
}

#[derive(Clone)]
pub struct SaslCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        BUILTIN_MECHANISMS
            .iter()
            .find(|mechanism| mechanism.name() == name)
            .copied()
    }
}

impl fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const BUILTIN_MECHANISMS: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, ConnectionError> {
    let init_failed = |error: sasl::client::MechanismError| ConnectionError::Sasl {
        condition: "mechanism-initialization".to_string(),
        text: Some(format!("failed to initialize {selected}: {error:?}")),
    };

    match selected {
        SelectedMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(init_failed),
        SelectedMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(init_failed),
        SelectedMechanism::Plain => Plain::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(init_failed),
    }
}

/// Adapts the `sasl` crate's client mechanisms.
struct BuiltinMechanism {
    inner: Box<dyn Mechanism + Send>,
    complete: bool,
}

impl SaslMechanism for BuiltinMechanism {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        let initial = self.inner.initial();
        Ok((!initial.is_empty()).then_some(initial))
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.inner
            .response(challenge)
            .map_err(|error| ConnectionError::Sasl {
                condition: "malformed-challenge".to_string(),
                text: Some(format!("{error:?}")),
            })
    }

    fn verify_success(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.inner
            .success(data)
            .map_err(|error| ConnectionError::Sasl {
                condition: "server-verification-failed".to_string(),
                text: Some(format!("{error:?}")),
            })?;
        self.complete = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

pub type MechanismFactory =
    Arc<dyn Fn(&SaslCredentials) -> Result<Box<dyn SaslMechanism>, ConnectionError> + Send + Sync>;

/// Client mechanisms in preference order, built-ins plus registered factories.
#[derive(Clone)]
pub struct MechanismSet {
    preference: Vec<String>,
    factories: HashMap<String, MechanismFactory>,
}

impl Default for MechanismSet {
    fn default() -> Self {
        Self {
            preference: BUILTIN_MECHANISMS
                .iter()
                .map(|mechanism| mechanism.name().to_string())
                .collect(),
            factories: HashMap::new(),
        }
    }
}

impl fmt::Debug for MechanismSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismSet")
            .field("preference", &self.preference)
            .finish_non_exhaustive()
    }
}

impl MechanismSet {
    /// Restricts and orders the mechanisms the client will try.
    pub fn with_preference(preference: Vec<String>) -> Self {
        Self {
            preference,
            factories: HashMap::new(),
        }
    }

    pub fn preference(&self) -> &[String] {
        &self.preference
    }

    /// Adds a custom mechanism ahead of all others.
    pub fn register(&mut self, name: impl Into<String>, factory: MechanismFactory) {
        let name = name.into();
        self.preference.retain(|existing| *existing != name);
        self.preference.insert(0, name.clone());
        self.factories.insert(name, factory);
    }

    /// Most preferred mechanism the server offers. `PLAIN` is skipped on an
    /// unencrypted stream unless `allow_plain_in_clear` is set.
    pub fn select(
        &self,
        offered: &HashSet<String>,
        secure: bool,
        allow_plain_in_clear: bool,
    ) -> Option<&str> {
        self.preference
            .iter()
            .filter(|name| offered.contains(name.as_str()))
            .filter(|name| secure || allow_plain_in_clear || name.as_str() != "PLAIN")
            .find(|name| {
                self.factories.contains_key(name.as_str())
                    || SelectedMechanism::from_name(name).is_some()
            })
            .map(String::as_str)
    }

    pub fn build(
        &self,
        name: &str,
        credentials: &SaslCredentials,
    ) -> Result<Box<dyn SaslMechanism>, ConnectionError> {
        if let Some(factory) = self.factories.get(name) {
            return factory(credentials);
        }

        let selected = SelectedMechanism::from_name(name).ok_or_else(|| {
            ConnectionError::Configuration(format!("unknown SASL mechanism '{name}'"))
        })?;
        let credentials = Credentials::default()
            .with_username(credentials.username.clone())
            .with_password(credentials.password.clone())
            .with_channel_binding(ChannelBinding::Unsupported);
        Ok(Box::new(BuiltinMechanism {
            inner: build_mechanism(selected, &credentials)?,
            complete: false,
        }))
    }
}

/// Base64 payload of an `<auth/>` or `<response/>`; empty data is sent as `=`.
pub fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64_STANDARD.encode(data)
    }
}

pub fn decode_payload(text: &str) -> Result<Vec<u8>, ConnectionError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(text)
        .map_err(|error| ConnectionError::Sasl {
            condition: "incorrect-encoding".to_string(),
            text: Some(error.to_string()),
        })
}

pub fn auth_element(mechanism: &str, initial: Option<&[u8]>) -> Element {
    let mut builder = Element::builder("auth", ns::SASL).attr("mechanism", mechanism);
    if let Some(initial) = initial {
        builder = builder.text(encode_payload(initial));
    }
    builder.build()
}

pub fn response_element(data: &[u8]) -> Element {
    let builder = Element::builder("response", ns::SASL);
    if data.is_empty() {
        builder.build()
    } else {
        builder.text(BASE64_STANDARD.encode(data)).build()
    }
}

pub(crate) fn map_failure(failure: &Element) -> ConnectionError {
    let condition = failure
        .children()
        .find(|child| child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "not-authorized".to_string());
    let text = failure
        .get_child("text", ns::SASL)
        .map(Element::text)
        .filter(|text| !text.is_empty());
    ConnectionError::Sasl { condition, text }
}
