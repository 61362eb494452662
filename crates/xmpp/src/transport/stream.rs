use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{Transport, TransportReader, TransportWriter, map_io_error, tls};
use crate::codec::{STREAM_CLOSE, StreamHeader};
use crate::error::ConnectionError;

const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// A classic XMPP stream over any byte stream.
pub struct StreamTransport<S> {
    stream: S,
    secure: bool,
    io_timeout: Duration,
    closed: bool,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// `secure` records whether `stream` is already encrypted.
    pub fn new(stream: S, secure: bool, io_timeout: Duration) -> Self {
        Self {
            stream,
            secure,
            io_timeout,
            closed: false,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        write_with_timeout(&mut self.stream, self.io_timeout, data).await
    }
}

async fn write_with_timeout<W>(
    writer: &mut W,
    io_timeout: Duration,
    data: &[u8],
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }

    timeout(io_timeout, writer.write_all(data))
        .await
        .map_err(|_| ConnectionError::Timeout { phase: "write" })?
        .map_err(map_io_error)?;

    timeout(io_timeout, writer.flush())
        .await
        .map_err(|_| ConnectionError::Timeout { phase: "write" })?
        .map_err(map_io_error)
}

async fn read_chunk<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0_u8; RECV_BUFFER_SIZE];
    let bytes_read = reader.read(&mut chunk).await.map_err(map_io_error)?;
    if bytes_read == 0 {
        return Ok(None);
    }
    chunk.truncate(bytes_read);
    Ok(Some(chunk))
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn open_stream(&mut self, header: &StreamHeader) -> Result<(), ConnectionError> {
        self.write_all(header.to_xml().as_bytes()).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.write_all(data).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        read_chunk(&mut self.stream).await
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        let _ = self.write_all(STREAM_CLOSE.as_bytes()).await;
        timeout(self.io_timeout, self.stream.shutdown())
            .await
            .map_err(|_| ConnectionError::Timeout { phase: "close" })?
            .map_err(map_io_error)
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (reader, writer) = tokio::io::split(self.stream);
        (
            Box::new(StreamReader { reader }),
            Box::new(StreamWriter {
                writer,
                io_timeout: self.io_timeout,
                closed: self.closed,
            }),
        )
    }
}

struct StreamReader<S> {
    reader: ReadHalf<S>,
}

#[async_trait]
impl<S> TransportReader for StreamReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        read_chunk(&mut self.reader).await
    }
}

struct StreamWriter<S> {
    writer: WriteHalf<S>,
    io_timeout: Duration,
    closed: bool,
}

#[async_trait]
impl<S> TransportWriter for StreamWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        write_with_timeout(&mut self.writer, self.io_timeout, data).await
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        let _ = write_with_timeout(&mut self.writer, self.io_timeout, STREAM_CLOSE.as_bytes()).await;
        timeout(self.io_timeout, self.writer.shutdown())
            .await
            .map_err(|_| ConnectionError::Timeout { phase: "close" })?
            .map_err(map_io_error)
    }
}

/// Plain TCP connection that can be upgraded with StartTLS.
pub struct TcpTransport {
    inner: StreamTransport<TcpStream>,
    host: String,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self, ConnectionError> {
        let stream = open_tcp(host, port, io_timeout).await?;
        Ok(Self {
            inner: StreamTransport::new(stream, false, io_timeout),
            host: host.to_string(),
        })
    }

    /// Connects and performs the TLS handshake before any XMPP traffic.
    pub async fn connect_direct_tls(
        host: &str,
        port: u16,
        domain: &str,
        io_timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        let stream = open_tcp(host, port, io_timeout).await?;
        let tls_stream = tls::handshake(stream, domain, io_timeout).await?;
        Ok(Box::new(StreamTransport::new(tls_stream, true, io_timeout)))
    }
}

async fn open_tcp(host: &str, port: u16, io_timeout: Duration) -> Result<TcpStream, ConnectionError> {
    debug!(host, port, "opening TCP connection");
    let stream = timeout(io_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ConnectionError::Timeout { phase: "connect" })?
        .map_err(map_io_error)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open_stream(&mut self, header: &StreamHeader) -> Result<(), ConnectionError> {
        self.inner.open_stream(header).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.inner.send(data).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        self.inner.recv().await
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn supports_starttls(&self) -> bool {
        true
    }

    fn start_tls(
        self: Box<Self>,
        domain: String,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, ConnectionError>> {
        Box::pin(async move {
            let io_timeout = self.inner.io_timeout;
            debug!(host = %self.host, %domain, "upgrading stream to TLS");
            let tls_stream = tls::handshake(self.inner.stream, &domain, io_timeout).await?;
            Ok(Box::new(StreamTransport::new(tls_stream, true, io_timeout)) as Box<dyn Transport>)
        })
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.inner.close().await
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        Box::new(self.inner).split()
    }
}
