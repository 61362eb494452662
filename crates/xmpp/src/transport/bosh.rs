//! XEP-0124/XEP-0206 XMPP over BOSH.
//!
//! Every request is an HTTP POST of a `<body/>` wrapper. Inbound payloads are
//! unwrapped and queued so the codec sees an ordinary stream: the session
//! creation and restart responses are preceded by a synthesized stream header.
//!
//! The empty long-poll runs on its own task so payloads returned by the
//! writer's requests reach the reader while the poll is still held.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Transport, TransportReader, TransportWriter, tls};
use crate::codec::{STREAM_CLOSE, StreamHeader};
use crate::config::ConnectionConfig;
use crate::element::Element;
use crate::error::ConnectionError;
use crate::ns;

const BOSH_VERSION: &str = "1.6";
const WAIT_SECONDS: u64 = 60;
const HOLD: &str = "1";

/// State shared by the reading and writing halves of one BOSH session.
struct BoshSession {
    client: reqwest::Client,
    url: String,
    sid: OnceLock<String>,
    rid: AtomicU64,
    terminated: AtomicBool,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

type LongPoll = JoinHandle<Result<(), ConnectionError>>;

pub struct BoshTransport {
    session: Arc<BoshSession>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    poll: Option<LongPoll>,
}

impl BoshTransport {
    pub fn new(url: &str, io_timeout: Duration) -> Result<Self, ConnectionError> {
        tls::init_crypto_provider();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WAIT_SECONDS) + io_timeout)
            .build()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let (sender, inbound) = mpsc::unbounded_channel();

        Ok(Self {
            session: Arc::new(BoshSession {
                client,
                url: url.to_string(),
                sid: OnceLock::new(),
                rid: AtomicU64::new(rand::rng().random_range(1_000_000..(1_u64 << 40))),
                terminated: AtomicBool::new(false),
                inbound: sender,
            }),
            inbound,
            poll: None,
        })
    }
}

/// BOSH endpoint for `config`: the configured URL, or `/http-bind` on the
/// configured host or account domain.
pub(crate) fn resolve_url(config: &ConnectionConfig) -> Result<String, ConnectionError> {
    match config.server.as_deref() {
        Some(server) if server.starts_with("http://") || server.starts_with("https://") => {
            Ok(server.to_string())
        }
        Some(server) if server.contains("://") => Err(ConnectionError::Configuration(format!(
            "unsupported BOSH scheme for server '{server}'"
        ))),
        Some(server) => {
            let host = server.trim_matches('/');
            if host.is_empty() {
                return Err(ConnectionError::Configuration(
                    "server value cannot be empty".to_string(),
                ));
            }
            Ok(match config.port {
                Some(port) => format!("https://{host}:{port}/http-bind"),
                None => format!("https://{host}/http-bind"),
            })
        }
        None => Ok(format!("https://{}/http-bind", config.domain())),
    }
}

impl BoshSession {
    fn next_rid(&self) -> u64 {
        self.rid.fetch_add(1, Ordering::SeqCst)
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn sid(&self) -> Result<&str, ConnectionError> {
        self.sid
            .get()
            .map(String::as_str)
            .ok_or_else(|| ConnectionError::Transport("BOSH session not established".to_string()))
    }

    async fn open(&self, header: &StreamHeader) -> Result<(), ConnectionError> {
        let domain = header.to.as_deref().unwrap_or_default();
        let mut body = Element::builder("body", ns::HTTPBIND)
            .attr("rid", self.next_rid().to_string())
            .attr("to", domain)
            .attr_opt("xml:lang", header.lang.clone())
            .attr("xmlns:xmpp", ns::XBOSH);

        let restart = self.sid.get().is_some();
        body = if restart {
            body.attr("sid", self.sid()?).attr("xmpp:restart", "true")
        } else {
            body.attr("content", "text/xml; charset=utf-8")
                .attr("hold", HOLD)
                .attr("ver", BOSH_VERSION)
                .attr("wait", WAIT_SECONDS.to_string())
                .attr("xmpp:version", "1.0")
        };

        let response = self.post(body.build().to_xml()).await?;

        if !restart {
            let sid = response.attr("sid").ok_or_else(|| {
                ConnectionError::ProtocolViolation("session creation response lacks a sid".to_string())
            })?;
            let _ = self.sid.set(sid.to_string());
            debug!(sid, "BOSH session created");
        }

        let stream_header = StreamHeader {
            to: None,
            from: response.attr("from").map(str::to_string).or_else(|| header.to.clone()),
            id: response
                .attr("authid")
                .map(str::to_string)
                .or_else(|| self.sid.get().cloned()),
            version: Some("1.0".to_string()),
            lang: None,
        };
        self.enqueue(stream_header.to_xml().into_bytes());
        self.unwrap_response(&response)
    }

    /// Posts `payload` in a session body and queues whatever comes back.
    async fn exchange(&self, payload: &str) -> Result<(), ConnectionError> {
        let body = format!(
            "<body rid='{}' sid='{}' xmlns='{}'>{payload}</body>",
            self.next_rid(),
            self.sid()?,
            ns::HTTPBIND
        );
        let response = self.post(body).await?;
        self.unwrap_response(&response)
    }

    async fn terminate(&self) -> Result<(), ConnectionError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Ok(sid) = self.sid() else {
            return Ok(());
        };
        let body = format!(
            "<body rid='{}' sid='{sid}' type='terminate' xmlns='{}'/>",
            self.next_rid(),
            ns::HTTPBIND
        );
        self.post(body).await.map(|_| ())
    }

    async fn post(&self, body: String) -> Result<Element, ConnectionError> {
        trace!(%body, "BOSH request");
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            self.terminated.store(true, Ordering::SeqCst);
            return Err(ConnectionError::Transport(format!(
                "BOSH request failed with HTTP {status}"
            )));
        }

        let text = response.text().await.map_err(map_http_error)?;
        trace!(body = %text, "BOSH response");
        Element::parse(&text).map_err(|error| {
            ConnectionError::ProtocolViolation(format!("invalid BOSH response: {error}"))
        })
    }

    fn unwrap_response(&self, body: &Element) -> Result<(), ConnectionError> {
        if !body.is("body", ns::HTTPBIND) {
            return Err(ConnectionError::ProtocolViolation(format!(
                "expected <body/>, found <{}/>",
                body.name()
            )));
        }

        for child in body.children() {
            self.enqueue(child.to_xml_in(ns::CLIENT).into_bytes());
        }

        if body.attr("type") == Some("terminate") {
            self.terminated.store(true, Ordering::SeqCst);
            match body.attr("condition") {
                Some(condition) => {
                    warn!(condition, "BOSH session terminated by server");
                    return Err(ConnectionError::StreamError {
                        condition: condition.to_string(),
                        text: None,
                    });
                }
                None => self.enqueue(STREAM_CLOSE.as_bytes().to_vec()),
            }
        }
        Ok(())
    }

    fn enqueue(&self, payload: Vec<u8>) {
        // The receiver only goes away with the transport itself.
        let _ = self.inbound.send(payload);
    }
}

/// Next inbound payload. Keeps one empty long-poll in flight while waiting
/// and returns as soon as any request has queued something.
async fn next_payload(
    session: &Arc<BoshSession>,
    inbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    poll: &mut Option<LongPoll>,
) -> Result<Option<Vec<u8>>, ConnectionError> {
    loop {
        if let Ok(payload) = inbound.try_recv() {
            return Ok(Some(payload));
        }
        if session.is_terminated() {
            return Ok(None);
        }

        let pending = poll.get_or_insert_with(|| {
            let session = Arc::clone(session);
            tokio::spawn(async move { session.exchange("").await })
        });
        let finished = tokio::select! {
            payload = inbound.recv() => return Ok(payload),
            finished = pending => finished,
        };
        *poll = None;
        finished.map_err(|error| {
            ConnectionError::Transport(format!("BOSH long-poll task failed: {error}"))
        })??;
    }
}

fn map_http_error(error: reqwest::Error) -> ConnectionError {
    if error.is_timeout() {
        ConnectionError::Timeout { phase: "http request" }
    } else {
        ConnectionError::Transport(error.to_string())
    }
}

fn payload_str(data: &[u8]) -> Result<&str, ConnectionError> {
    std::str::from_utf8(data)
        .map_err(|error| ConnectionError::Transport(format!("payload is not UTF-8: {error}")))
}

#[async_trait]
impl Transport for BoshTransport {
    async fn open_stream(&mut self, header: &StreamHeader) -> Result<(), ConnectionError> {
        self.session.open(header).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let payload = payload_str(data)?;
        if payload.trim().is_empty() {
            return Ok(());
        }
        self.session.exchange(payload).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        next_payload(&self.session, &mut self.inbound, &mut self.poll).await
    }

    fn is_secure(&self) -> bool {
        self.session.url.starts_with("https://")
    }

    fn requires_stanza_namespace(&self) -> bool {
        true
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.session.terminate().await
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let BoshTransport {
            session,
            inbound,
            poll,
        } = *self;
        (
            Box::new(BoshReader {
                session: Arc::clone(&session),
                inbound,
                poll,
            }),
            Box::new(BoshWriter { session }),
        )
    }
}

struct BoshReader {
    session: Arc<BoshSession>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    poll: Option<LongPoll>,
}

#[async_trait]
impl TransportReader for BoshReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        next_payload(&self.session, &mut self.inbound, &mut self.poll).await
    }
}

impl Drop for BoshReader {
    fn drop(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
    }
}

struct BoshWriter {
    session: Arc<BoshSession>,
}

#[async_trait]
impl TransportWriter for BoshWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let payload = payload_str(data)?;
        if payload.trim().is_empty() {
            return Ok(());
        }
        self.session.exchange(payload).await
    }

    fn requires_stanza_namespace(&self) -> bool {
        true
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.session.terminate().await
    }
}
