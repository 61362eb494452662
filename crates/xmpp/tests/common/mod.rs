//! Test utilities: an in-memory connector and a scripted XMPP server.
//!
//! The server side decodes client traffic with the crate's own codec so
//! scripts can assert on parsed elements rather than raw bytes.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use plover_xmpp::codec::{Packet, StreamHeader, XmppCodec};
use plover_xmpp::transport::{StreamTransport, Transport, TransportConnector};
use plover_xmpp::{BackoffStrategy, ConnectionConfig, ConnectionError, Element, ReconnectPolicy};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Decoder;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='stream-1' version='1.0'>";

pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const SM_NS: &str = "urn:xmpp:sm:3";

/// Client configuration for `alice@example.com/desk` with fast retries.
pub fn test_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::new("alice@example.com/desk".parse().expect("valid JID"), "secret");
    config.negotiation_timeout = DEFAULT_TIMEOUT;
    config.reply_timeout = DEFAULT_TIMEOUT;
    config.reconnect =
        ReconnectPolicy::new(BackoffStrategy::Fixed(Duration::from_millis(20)), 3).without_jitter();
    config
}

/// Hands every connection attempt an in-memory stream whose server end is
/// delivered to the test.
pub struct DuplexConnector {
    servers: mpsc::UnboundedSender<ScriptedServer>,
    attempts: AtomicUsize,
}

impl DuplexConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ScriptedServer>) {
        let (servers, incoming) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                servers,
                attempts: AtomicUsize::new(0),
            }),
            incoming,
        )
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for DuplexConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Transport>, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.servers
            .send(ScriptedServer::new(server))
            .map_err(|_| ConnectionError::Transport("test server is gone".to_string()))?;
        // Reported as already encrypted so PLAIN and SCRAM are allowed.
        Ok(Box::new(StreamTransport::new(client, true, DEFAULT_TIMEOUT)))
    }
}

/// Waits for the next connection attempt.
pub async fn accept(incoming: &mut mpsc::UnboundedReceiver<ScriptedServer>) -> ScriptedServer {
    timeout(DEFAULT_TIMEOUT, incoming.recv())
        .await
        .expect("client connects in time")
        .expect("connector is alive")
}

pub struct ScriptedServer {
    stream: DuplexStream,
    codec: XmppCodec,
    buffer: BytesMut,
}

impl ScriptedServer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            codec: XmppCodec::new(),
            buffer: BytesMut::new(),
        }
    }

    /// Next packet from the client, or `None` once it hung up.
    pub async fn try_next_packet(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self
                .codec
                .decode(&mut self.buffer)
                .expect("client sends well-formed XML")
            {
                return Some(packet);
            }
            let read = timeout(DEFAULT_TIMEOUT, self.stream.read_buf(&mut self.buffer))
                .await
                .expect("client went quiet")
                .ok()?;
            if read == 0 {
                return None;
            }
        }
    }

    pub async fn next_packet(&mut self) -> Packet {
        self.try_next_packet().await.expect("client hung up")
    }

    pub async fn next_element(&mut self) -> Element {
        match self.next_packet().await {
            Packet::Stanza(element) => element,
            other => panic!("expected an element, got {other:?}"),
        }
    }

    pub async fn expect_stream_open(&mut self) -> StreamHeader {
        match self.next_packet().await {
            Packet::StreamStart(header) => header,
            other => panic!("expected a stream header, got {other:?}"),
        }
    }

    /// Reads until the client closes its stream or hangs up.
    pub async fn expect_stream_end(&mut self) {
        while let Some(packet) = self.try_next_packet().await {
            if matches!(packet, Packet::StreamEnd) {
                return;
            }
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.stream
            .write_all(xml.as_bytes())
            .await
            .expect("server write");
    }

    /// Answers the client's stream header with ours and `features`.
    pub async fn open_stream(&mut self, features: &str) {
        self.codec.reset();
        self.expect_stream_open().await;
        self.send(&format!("{SERVER_HEADER}<stream:features>{features}</stream:features>"))
            .await;
    }

    /// PLAIN login followed by binding `jid`, optionally enabling stream
    /// management with resumption under `sm_id`.
    pub async fn login(&mut self, jid: &str, sm_id: Option<&str>) {
        self.open_stream(&mechanisms(&["PLAIN"])).await;
        let auth = self.next_element().await;
        assert!(auth.is("auth", SASL_NS));
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;

        let sm_feature = if sm_id.is_some() {
            "<sm xmlns='urn:xmpp:sm:3'/>"
        } else {
            ""
        };
        self.open_stream(&format!(
            "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>{sm_feature}"
        ))
        .await;
        self.answer_bind(jid).await;

        if let Some(sm_id) = sm_id {
            let enable = self.next_element().await;
            assert!(enable.is("enable", SM_NS));
            self.send(&format!(
                "<enabled xmlns='urn:xmpp:sm:3' id='{sm_id}' resume='true' max='300'/>"
            ))
            .await;
        }
    }

    pub async fn answer_bind(&mut self, jid: &str) {
        let bind = self.next_element().await;
        assert_eq!(bind.name(), "iq");
        let id = bind.attr("id").expect("bind request has an id").to_string();
        self.send(&format!(
            "<iq type='result' id='{id}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>{jid}</jid></bind></iq>"
        ))
        .await;
    }

    /// Drops the connection without closing the stream.
    pub fn hang_up(self) {
        drop(self);
    }
}

pub fn mechanisms(names: &[&str]) -> String {
    let offered: String = names
        .iter()
        .map(|name| format!("<mechanism>{name}</mechanism>"))
        .collect();
    format!("<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{offered}</mechanisms>")
}

type HmacSha1 = Hmac<Sha1>;

/// Server side of SCRAM-SHA-1 for a single account.
pub struct ScramSha1Server {
    password: String,
    salt: Vec<u8>,
    iterations: u32,
    exchange: Option<ScramExchange>,
}

struct ScramExchange {
    client_first_bare: String,
    server_first: String,
    nonce: String,
}

impl ScramSha1Server {
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            salt: b"plover-test-salt".to_vec(),
            iterations: 4096,
            exchange: None,
        }
    }

    /// Builds the server-first-message for a decoded client-first-message.
    pub fn server_first(&mut self, client_first: &str) -> String {
        let bare = client_first
            .strip_prefix("n,,")
            .expect("client does not use channel binding");
        let client_nonce = bare
            .split(',')
            .find_map(|part| part.strip_prefix("r="))
            .expect("client-first carries a nonce");
        let nonce = format!("{client_nonce}3rfcNHYJY1ZVvWVs7j");
        let server_first = format!(
            "r={nonce},s={},i={}",
            BASE64_STANDARD.encode(&self.salt),
            self.iterations
        );
        self.exchange = Some(ScramExchange {
            client_first_bare: bare.to_string(),
            server_first: server_first.clone(),
            nonce,
        });
        server_first
    }

    /// Verifies the client proof; returns the server-final-message on success.
    pub fn server_final(&mut self, client_final: &str) -> Option<String> {
        let exchange = self.exchange.take()?;
        let (without_proof, proof) = client_final.rsplit_once(",p=")?;
        if !without_proof.contains(&format!("r={}", exchange.nonce)) {
            return None;
        }
        let auth_message = format!(
            "{},{},{}",
            exchange.client_first_bare, exchange.server_first, without_proof
        );

        let mut salted_password = [0_u8; 20];
        pbkdf2_hmac::<Sha1>(
            self.password.as_bytes(),
            &self.salt,
            self.iterations,
            &mut salted_password,
        );
        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key);
        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());

        let proof = BASE64_STANDARD.decode(proof).ok()?;
        if proof.len() != client_signature.len() {
            return None;
        }
        let recovered_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        if Sha1::digest(&recovered_key) != stored_key {
            return None;
        }

        let server_key = hmac_sha1(&salted_password, b"Server Key");
        let server_signature = hmac_sha1(&server_key, auth_message.as_bytes());
        Some(format!("v={}", BASE64_STANDARD.encode(server_signature)))
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn sasl_payload(element: &Element) -> String {
    let text = element.text();
    let decoded = BASE64_STANDARD
        .decode(text.trim())
        .expect("SASL payload is base64");
    String::from_utf8(decoded).expect("SASL payload is UTF-8")
}
