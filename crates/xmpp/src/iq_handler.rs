//! Answers inbound IQ `get`/`set` requests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::debug;

use crate::registry::QualifiedName;
use crate::stanza::{ExtensionElement, Iq, IqType, StanzaError, StanzaErrorCondition, StanzaErrorType};

#[async_trait]
pub trait IqRequestHandler: Send + Sync {
    /// `Ok` becomes a `result` carrying the optional payload, `Err` an `error` reply.
    async fn handle(&self, request: &Iq) -> Result<Option<Arc<dyn ExtensionElement>>, StanzaError>;
}

/// Reply to `get`/`set` requests nobody registered a handler for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownIqReply {
    #[default]
    ServiceUnavailable,
    FeatureNotImplemented,
    NoReply,
}

/// XEP-0199: answers pings with an empty result.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingResponder;

#[async_trait]
impl IqRequestHandler for PingResponder {
    async fn handle(&self, _: &Iq) -> Result<Option<Arc<dyn ExtensionElement>>, StanzaError> {
        Ok(None)
    }
}

pub struct IqHandlers {
    handlers: DashMap<(QualifiedName, IqType), Arc<dyn IqRequestHandler>>,
    unknown_reply: UnknownIqReply,
}

impl std::fmt::Debug for IqHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IqHandlers")
            .field("handlers", &self.handlers.len())
            .field("unknown_reply", &self.unknown_reply)
            .finish()
    }
}

impl IqHandlers {
    pub fn new(unknown_reply: UnknownIqReply) -> Self {
        Self {
            handlers: DashMap::new(),
            unknown_reply,
        }
    }

    /// Includes the ping responder.
    pub fn with_defaults(unknown_reply: UnknownIqReply) -> Self {
        let handlers = Self::new(unknown_reply);
        handlers.register(
            QualifiedName::new("ping", crate::ns::PING),
            IqType::Get,
            PingResponder,
        );
        handlers
    }

    /// Replaces and returns any handler already registered for the same key.
    pub fn register(
        &self,
        name: QualifiedName,
        iq_type: IqType,
        handler: impl IqRequestHandler + 'static,
    ) -> Option<Arc<dyn IqRequestHandler>> {
        self.handlers.insert((name, iq_type), Arc::new(handler))
    }

    pub fn unregister(&self, name: &QualifiedName, iq_type: IqType) -> Option<Arc<dyn IqRequestHandler>> {
        self.handlers
            .remove(&(name.clone(), iq_type))
            .map(|(_, handler)| handler)
    }

    /// The reply to send for `request`, if any.
    pub async fn handle(&self, request: &Iq) -> Option<Iq> {
        if !request.iq_type.is_request() {
            return None;
        }

        let Some(payload) = request.payload() else {
            return Some(Iq::error_for(
                request,
                StanzaError::new(StanzaErrorType::Modify, StanzaErrorCondition::BadRequest),
            ));
        };
        let name = QualifiedName::new(payload.element_name(), payload.namespace());

        // Clone out of the map so no shard lock is held across the await.
        let handler = self
            .handlers
            .get(&(name.clone(), request.iq_type))
            .map(|entry| Arc::clone(entry.value()));

        let Some(handler) = handler else {
            debug!(request = %name, iq_type = request.iq_type.as_str(), "no handler for IQ request");
            return match self.unknown_reply {
                UnknownIqReply::ServiceUnavailable => {
                    Some(Iq::error_for(request, StanzaError::service_unavailable()))
                }
                UnknownIqReply::FeatureNotImplemented => {
                    Some(Iq::error_for(request, StanzaError::feature_not_implemented()))
                }
                UnknownIqReply::NoReply => None,
            };
        };

        Some(match handler.handle(request).await {
            Ok(payload) => Iq::result_for(request, payload),
            Err(error) => Iq::error_for(request, error),
        })
    }
}

#[cfg(test)]
mod tests {
    use xmpp_parsers::jid::Jid;

    use super::*;
    use crate::element::Element;
    use crate::stanza::{Ping, RawExtension};

    fn request(iq_type: IqType, payload: impl ExtensionElement) -> Iq {
        let mut iq = match iq_type {
            IqType::Set => Iq::set(None, payload),
            _ => Iq::get(None, payload),
        };
        iq.envelope.id = Some("req-1".to_string());
        iq.envelope.from = Some("example.com".parse::<Jid>().expect("valid JID"));
        iq
    }

    #[tokio::test]
    async fn ping_gets_empty_result() {
        let handlers = IqHandlers::with_defaults(UnknownIqReply::default());

        let reply = handlers
            .handle(&request(IqType::Get, Ping))
            .await
            .expect("ping is answered");

        assert_eq!(reply.iq_type, IqType::Result);
        assert_eq!(reply.envelope.id.as_deref(), Some("req-1"));
        assert_eq!(reply.envelope.to.as_ref().map(|jid| jid.to_string()).as_deref(), Some("example.com"));
        assert!(reply.payload().is_none());
    }

    #[tokio::test]
    async fn unknown_request_gets_service_unavailable() {
        let handlers = IqHandlers::with_defaults(UnknownIqReply::ServiceUnavailable);
        let payload = RawExtension::new(Element::new("query", "jabber:iq:version"));

        let reply = handlers
            .handle(&request(IqType::Get, payload))
            .await
            .expect("unknown request is answered");

        assert_eq!(reply.iq_type, IqType::Error);
        assert_eq!(
            reply.envelope.error.map(|error| error.condition),
            Some(StanzaErrorCondition::ServiceUnavailable)
        );
    }

    #[tokio::test]
    async fn unknown_reply_is_configurable() {
        let payload = || RawExtension::new(Element::new("query", "jabber:iq:version"));

        let handlers = IqHandlers::new(UnknownIqReply::FeatureNotImplemented);
        let reply = handlers
            .handle(&request(IqType::Get, payload()))
            .await
            .expect("unknown request is answered");
        assert_eq!(
            reply.envelope.error.map(|error| error.condition),
            Some(StanzaErrorCondition::FeatureNotImplemented)
        );

        let silent = IqHandlers::new(UnknownIqReply::NoReply);
        assert!(silent.handle(&request(IqType::Get, payload())).await.is_none());
    }

    struct Refuse;

    #[async_trait]
    impl IqRequestHandler for Refuse {
        async fn handle(&self, _: &Iq) -> Result<Option<Arc<dyn ExtensionElement>>, StanzaError> {
            Err(StanzaError::new(StanzaErrorType::Auth, StanzaErrorCondition::Forbidden))
        }
    }

    #[tokio::test]
    async fn handlers_are_keyed_by_request_type() {
        let handlers = IqHandlers::new(UnknownIqReply::ServiceUnavailable);
        handlers.register(QualifiedName::new("ping", crate::ns::PING), IqType::Set, Refuse);

        let set_reply = handlers
            .handle(&request(IqType::Set, Ping))
            .await
            .expect("set is answered");
        assert_eq!(
            set_reply.envelope.error.map(|error| error.condition),
            Some(StanzaErrorCondition::Forbidden)
        );

        let get_reply = handlers
            .handle(&request(IqType::Get, Ping))
            .await
            .expect("get is answered");
        assert_eq!(
            get_reply.envelope.error.map(|error| error.condition),
            Some(StanzaErrorCondition::ServiceUnavailable)
        );
    }

    #[tokio::test]
    async fn results_are_never_answered() {
        let handlers = IqHandlers::with_defaults(UnknownIqReply::ServiceUnavailable);
        assert!(handlers.handle(&Iq::new(IqType::Result)).await.is_none());
    }
}
