//! Byte transports carrying an XMPP stream.
//!
//! Every transport presents the classic RFC 6120 stream to the codec: a
//! stream header, top-level elements and the closing tag. WebSocket and BOSH
//! translate their own framing to and from that shape.

mod bosh;
mod stream;
mod tls;
mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub use self::bosh::BoshTransport;
pub use self::stream::{StreamTransport, TcpTransport};
pub use self::websocket::WebSocketTransport;
use crate::codec::StreamHeader;
use crate::config::{ConnectionConfig, DEFAULT_CLIENT_PORT, TransportKind};
use crate::error::ConnectionError;

const MIN_TIMEOUT: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Transport: Send {
    /// Opens a stream, or restarts it after StartTLS or SASL.
    async fn open_stream(&mut self, header: &StreamHeader) -> Result<(), ConnectionError>;

    /// Sends one or more serialized top-level elements.
    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Next chunk of inbound stream bytes; `None` once the peer has gone away.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;

    fn is_secure(&self) -> bool;

    fn supports_starttls(&self) -> bool {
        false
    }

    /// Upgrades the connection after the server's `<proceed/>`.
    fn start_tls(
        self: Box<Self>,
        domain: String,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, ConnectionError>> {
        let _ = domain;
        Box::pin(async {
            Err(ConnectionError::Tls(
                "transport does not support StartTLS".to_string(),
            ))
        })
    }

    /// Stanzas are framed as standalone documents and must declare
    /// `jabber:client` themselves.
    fn requires_stanza_namespace(&self) -> bool {
        false
    }

    /// Ends the stream and releases the connection. Safe to call twice.
    async fn close(&mut self) -> Result<(), ConnectionError>;

    /// Separates the read and write directions once negotiation is done.
    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

#[async_trait]
pub trait TransportReader: Send {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;
}

#[async_trait]
pub trait TransportWriter: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    fn requires_stanza_namespace(&self) -> bool {
        false
    }

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Opens transports for a connection; swapped out in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// Picks the transport named by [`ConnectionConfig::transport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, ConnectionError> {
        let io_timeout = config.negotiation_timeout.max(MIN_TIMEOUT);
        match config.transport {
            TransportKind::Tcp => {
                let (host, port) = tcp_target(config);
                Ok(Box::new(TcpTransport::connect(&host, port, io_timeout).await?))
            }
            TransportKind::DirectTls => {
                let (host, port) = tcp_target(config);
                TcpTransport::connect_direct_tls(&host, port, &config.domain(), io_timeout).await
            }
            TransportKind::Websocket => {
                let url = websocket::resolve_url(config)?;
                Ok(Box::new(WebSocketTransport::connect(&url, io_timeout).await?))
            }
            TransportKind::Bosh => {
                let url = bosh::resolve_url(config)?;
                Ok(Box::new(BoshTransport::new(&url, io_timeout)?))
            }
        }
    }
}

fn tcp_target(config: &ConnectionConfig) -> (String, u16) {
    let host = config.server.clone().unwrap_or_else(|| config.domain());
    (host, config.port.unwrap_or(DEFAULT_CLIENT_PORT))
}

pub(crate) fn map_io_error(error: std::io::Error) -> ConnectionError {
    ConnectionError::Transport(error.to_string())
}
