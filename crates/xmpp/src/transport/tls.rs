use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::error::ConnectionError;

/// Installs the ring provider for rustls; later calls are no-ops.
pub(crate) fn init_crypto_provider() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Connector trusting the platform's root certificates.
pub(crate) fn connector() -> Result<TlsConnector, ConnectionError> {
    init_crypto_provider();

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for error in &native_certs.errors {
        warn!(%error, "Failed to load a native root certificate");
    }
    if native_certs.certs.is_empty() {
        return Err(ConnectionError::Tls(
            "no system root certificates found".to_string(),
        ));
    }
    let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
    debug!(added, ignored, "Loaded native root certificates");

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Runs the client handshake for `domain` over an established stream.
pub(crate) async fn handshake<S>(
    stream: S,
    domain: &str,
    io_timeout: Duration,
) -> Result<TlsStream<S>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ConnectionError::Tls(format!("invalid server name {domain}: {e}")))?;
    let connector = connector()?;

    timeout(io_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| ConnectionError::Timeout { phase: "tls handshake" })?
        .map_err(|e| ConnectionError::Tls(e.to_string()))
}
