use std::time::Duration;

use thiserror::Error;

use crate::stanza::StanzaError;

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    #[error("authentication failed: {condition}{}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
    Sasl {
        condition: String,
        text: Option<String>,
    },

    #[error("resource binding failed: {0}")]
    Bind(String),

    #[error("timed out during {phase}")]
    Timeout { phase: &'static str },

    #[error("no response to '{id}' within {timeout:?}")]
    NoResponse { id: String, timeout: Duration },

    #[error("not connected")]
    NotConnected,

    #[error("stanza error: {0}")]
    Stanza(StanzaError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("stream error: {condition}{}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
    StreamError {
        condition: String,
        text: Option<String>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

/// Stream error conditions after which reconnecting would only repeat the failure.
const FATAL_STREAM_CONDITIONS: &[&str] = &[
    "conflict",
    "host-unknown",
    "improper-addressing",
    "not-authorized",
    "policy-violation",
    "unsupported-version",
];

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::Transport(_)
            | ConnectionError::Tls(_)
            | ConnectionError::Timeout { .. }
            | ConnectionError::NoResponse { .. }
            | ConnectionError::NotConnected
            | ConnectionError::ProtocolViolation(_) => true,
            ConnectionError::StreamError { condition, .. } => {
                !FATAL_STREAM_CONDITIONS.contains(&condition.as_str())
            }
            ConnectionError::Configuration(_)
            | ConnectionError::Sasl { .. }
            | ConnectionError::Bind(_)
            | ConnectionError::Stanza(_)
            | ConnectionError::Cancelled => false,
        }
    }
}

impl From<CodecError> for ConnectionError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Io(message) => ConnectionError::Transport(message),
            other => ConnectionError::ProtocolViolation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("stream is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("{0} are not allowed in XMPP streams")]
    Restricted(&'static str),

    #[error("namespace prefix '{0}' is not bound")]
    UnboundPrefix(String),

    #[error("end tag </{found}> does not match <{expected}>")]
    MismatchedEndTag { expected: String, found: String },

    #[error("XML token exceeds {limit} bytes")]
    TokenTooLarge { limit: usize },

    #[error("expected a stream header, found <{0}>")]
    UnexpectedRoot(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CodecError {
    fn from(error: std::io::Error) -> Self {
        CodecError::Io(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("<{0}/> is not a stanza")]
    NotAStanza(String),

    #[error("missing required attribute '{0}'")]
    MissingAttribute(&'static str),

    #[error("invalid value '{value}' for attribute '{attribute}'")]
    InvalidAttribute { attribute: &'static str, value: String },

    #[error("invalid JID '{0}'")]
    InvalidJid(String),

    #[error("invalid <{element}/> payload: {message}")]
    InvalidPayload { element: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{StanzaErrorCondition, StanzaErrorType};

    #[test]
    fn authentication_failures_are_not_retryable() {
        let error = ConnectionError::Sasl {
            condition: "not-authorized".to_string(),
            text: None,
        };
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "authentication failed: not-authorized");
    }

    #[test]
    fn transport_and_timeout_failures_are_retryable() {
        assert!(ConnectionError::Transport("reset by peer".to_string()).is_retryable());
        assert!(ConnectionError::Timeout { phase: "sasl" }.is_retryable());
    }

    #[test]
    fn conflict_stream_error_is_not_retried() {
        let conflict = ConnectionError::StreamError {
            condition: "conflict".to_string(),
            text: Some("replaced by new connection".to_string()),
        };
        assert!(!conflict.is_retryable());
        assert_eq!(
            conflict.to_string(),
            "stream error: conflict: replaced by new connection"
        );

        let shutdown = ConnectionError::StreamError {
            condition: "system-shutdown".to_string(),
            text: None,
        };
        assert!(shutdown.is_retryable());
    }

    #[test]
    fn cancellation_and_configuration_are_terminal() {
        assert!(!ConnectionError::Cancelled.is_retryable());
        assert!(!ConnectionError::Configuration("no password".to_string()).is_retryable());
        assert!(
            !ConnectionError::Stanza(StanzaError::new(
                StanzaErrorType::Cancel,
                StanzaErrorCondition::ItemNotFound
            ))
            .is_retryable()
        );
    }

    #[test]
    fn codec_errors_become_protocol_violations() {
        let error: ConnectionError = CodecError::Restricted("comments").into();
        assert!(matches!(error, ConnectionError::ProtocolViolation(_)));

        let error: ConnectionError = CodecError::Io("broken pipe".to_string()).into();
        assert!(matches!(error, ConnectionError::Transport(_)));
    }
}
