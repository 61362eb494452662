//! RFC 7395 XMPP over WebSocket.
//!
//! Each frame carries one complete element. `<open/>` and `<close/>` stand in
//! for the stream header and closing tag and are translated in both directions.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{Transport, TransportReader, TransportWriter, tls};
use crate::codec::{STREAM_CLOSE, StreamHeader};
use crate::config::ConnectionConfig;
use crate::element::Element;
use crate::error::ConnectionError;
use crate::ns;

const DEFAULT_WEBSOCKET_PORT: u16 = 443;
const SUBPROTOCOL: &str = "xmpp";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsError = tokio_tungstenite::tungstenite::Error;

pub struct WebSocketTransport {
    socket: Socket,
    io_timeout: Duration,
    closed: bool,
}

impl WebSocketTransport {
    pub async fn connect(url: &str, io_timeout: Duration) -> Result<Self, ConnectionError> {
        tls::init_crypto_provider();

        let mut request = url.into_client_request().map_err(map_websocket_error)?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        debug!(url, "opening WebSocket connection");
        let (socket, _response) = timeout(io_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ConnectionError::Timeout { phase: "connect" })?
            .map_err(map_websocket_error)?;

        Ok(Self {
            socket,
            io_timeout,
            closed: false,
        })
    }
}

/// WebSocket endpoint for `config`: the configured server, or the account domain.
pub(crate) fn resolve_url(config: &ConnectionConfig) -> Result<String, ConnectionError> {
    let default_port = config.port.unwrap_or(DEFAULT_WEBSOCKET_PORT);
    match config.server.as_deref() {
        Some(server) => server_to_websocket_url(server, default_port),
        None => Ok(format!(
            "wss://{}:{default_port}/xmpp-websocket",
            config.domain()
        )),
    }
}

fn server_to_websocket_url(server: &str, default_port: u16) -> Result<String, ConnectionError> {
    if server.starts_with("ws://") || server.starts_with("wss://") {
        return Ok(server.to_string());
    }

    if server.contains("://") {
        return Err(ConnectionError::Configuration(format!(
            "unsupported WebSocket scheme for server '{server}'"
        )));
    }

    let host_or_path = server.trim_matches('/');
    if host_or_path.is_empty() {
        return Err(ConnectionError::Configuration(
            "server value cannot be empty".to_string(),
        ));
    }

    if host_or_path.contains('/') {
        return Ok(format!("wss://{host_or_path}"));
    }

    let has_explicit_port = host_or_path
        .rsplit_once(':')
        .map(|(_, suffix)| suffix.chars().all(|character| character.is_ascii_digit()))
        .unwrap_or(false);

    if has_explicit_port {
        Ok(format!("wss://{host_or_path}/xmpp-websocket"))
    } else {
        Ok(format!("wss://{host_or_path}:{default_port}/xmpp-websocket"))
    }
}

fn map_websocket_error(error: WsError) -> ConnectionError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake") {
        ConnectionError::Tls(message)
    } else {
        ConnectionError::Transport(message)
    }
}

fn open_frame(header: &StreamHeader) -> String {
    Element::builder("open", ns::FRAMING)
        .attr_opt("to", header.to.clone())
        .attr_opt("from", header.from.clone())
        .attr_opt("version", header.version.clone())
        .attr_opt("xml:lang", header.lang.clone())
        .build()
        .to_xml()
}

fn close_frame() -> String {
    Element::new("close", ns::FRAMING).to_xml()
}

/// Rewrites an inbound frame into the bytes a classic stream would carry.
fn translate_inbound(frame: &str) -> Result<String, ConnectionError> {
    let element = Element::parse(frame).map_err(|error| {
        ConnectionError::ProtocolViolation(format!("invalid WebSocket frame: {error}"))
    })?;

    if element.is("open", ns::FRAMING) {
        let attr = |name: &str| element.attr(name).map(str::to_string);
        let header = StreamHeader {
            to: attr("to"),
            from: attr("from"),
            id: attr("id"),
            version: attr("version"),
            lang: attr("xml:lang"),
        };
        return Ok(header.to_xml());
    }

    if element.is("close", ns::FRAMING) {
        return Ok(STREAM_CLOSE.to_string());
    }

    Ok(frame.to_string())
}

async fn next_payload<S>(stream: &mut S) -> Result<Option<Vec<u8>>, ConnectionError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let message = match stream.next().await {
            None => return Ok(None),
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
            Some(Err(error)) => return Err(map_websocket_error(error)),
            Some(Ok(message)) => message,
        };

        let text = match message {
            Message::Text(text) => text.as_str().to_string(),
            Message::Binary(data) => String::from_utf8(data.to_vec()).map_err(|_| {
                ConnectionError::ProtocolViolation("binary frame is not UTF-8".to_string())
            })?,
            Message::Close(frame) => {
                debug!(?frame, "WebSocket closed by peer");
                return Ok(None);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        trace!(frame = %text, "received WebSocket frame");
        return translate_inbound(&text).map(|xml| Some(xml.into_bytes()));
    }
}

async fn send_text<S>(sink: &mut S, io_timeout: Duration, data: &[u8]) -> Result<(), ConnectionError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = std::str::from_utf8(data).map_err(|error| {
        ConnectionError::Transport(format!(
            "RFC 7395 requires UTF-8 text frames; invalid payload: {error}"
        ))
    })?;
    // Whitespace keepalives have no meaning on a framed transport.
    if text.trim().is_empty() {
        return Ok(());
    }

    timeout(io_timeout, sink.send(Message::Text(text.to_string().into())))
        .await
        .map_err(|_| ConnectionError::Timeout { phase: "write" })?
        .map_err(map_websocket_error)
}

async fn close_socket<S>(sink: &mut S, io_timeout: Duration) -> Result<(), ConnectionError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let _ = send_text(sink, io_timeout, close_frame().as_bytes()).await;
    match timeout(io_timeout, sink.close()).await {
        Err(_) => Err(ConnectionError::Timeout { phase: "close" }),
        Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(map_websocket_error(error)),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open_stream(&mut self, header: &StreamHeader) -> Result<(), ConnectionError> {
        send_text(&mut self.socket, self.io_timeout, open_frame(header).as_bytes()).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        send_text(&mut self.socket, self.io_timeout, data).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        next_payload(&mut self.socket).await
    }

    fn is_secure(&self) -> bool {
        matches!(self.socket.get_ref(), MaybeTlsStream::Rustls(_))
    }

    fn requires_stanza_namespace(&self) -> bool {
        true
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        close_socket(&mut self.socket, self.io_timeout).await
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketReader { stream }),
            Box::new(WebSocketWriter {
                sink,
                io_timeout: self.io_timeout,
                closed: self.closed,
            }),
        )
    }
}

struct WebSocketReader {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl TransportReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        next_payload(&mut self.stream).await
    }
}

struct WebSocketWriter {
    sink: SplitSink<Socket, Message>,
    io_timeout: Duration,
    closed: bool,
}

#[async_trait]
impl TransportWriter for WebSocketWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        send_text(&mut self.sink, self.io_timeout, data).await
    }

    fn requires_stanza_namespace(&self) -> bool {
        true
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        close_socket(&mut self.sink, self.io_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_host_gets_default_port_and_path() {
        let url = server_to_websocket_url("chat.example.com", 443).expect("host is accepted");
        assert_eq!(url, "wss://chat.example.com:443/xmpp-websocket");

        let url = server_to_websocket_url("chat.example.com:5443", 443).expect("port is kept");
        assert_eq!(url, "wss://chat.example.com:5443/xmpp-websocket");

        let url = server_to_websocket_url("wss://chat.example.com/ws", 443).expect("url is kept");
        assert_eq!(url, "wss://chat.example.com/ws");
    }

    #[test]
    fn unsupported_scheme_is_a_configuration_error() {
        let error = server_to_websocket_url("https://chat.example.com", 443)
            .expect_err("http scheme is rejected");
        assert!(matches!(error, ConnectionError::Configuration(_)));
    }

    #[test]
    fn open_frame_carries_header_attributes() {
        let frame = open_frame(&StreamHeader::client("example.com").with_lang(Some("en".to_string())));
        let element = Element::parse(&frame).expect("open frame parses");

        assert!(element.is("open", ns::FRAMING));
        assert_eq!(element.attr("to"), Some("example.com"));
        assert_eq!(element.attr("version"), Some("1.0"));
    }

    #[test]
    fn inbound_open_and_close_become_stream_boundaries() {
        let header = translate_inbound(
            "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' from='example.com' id='ws-1' version='1.0'/>",
        )
        .expect("open translates");
        assert!(header.contains("<stream:stream"));
        assert!(header.contains("id='ws-1'"));
        assert!(header.contains("from='example.com'"));

        let close = translate_inbound("<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>")
            .expect("close translates");
        assert_eq!(close, STREAM_CLOSE);
    }

    #[test]
    fn stanzas_pass_through_unchanged() {
        let frame = "<message xmlns='jabber:client' id='m1'><body>hi</body></message>";
        assert_eq!(translate_inbound(frame).expect("stanza is kept"), frame);
    }
}
