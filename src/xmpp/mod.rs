//! Transport: TCP/TLS connection to the chat server with an attached decode cursor.
//!
//! A [`Connection`] owns the byte stream and the [`framing::StanzaReader`]
//! decoding it. Both are replaced together on TLS upgrade. Once negotiated,
//! the connection is split into a [`ConnReader`] for the dispatcher task and
//! a [`ConnWriter`] shared by callers, with a [`CloseHandle`] that any task
//! can use to abort a blocked read.

pub mod dns;
pub mod element;
pub mod framing;
pub mod stanza;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use dns::{ConnectionMode, Endpoint};
use element::Element;
use framing::StanzaReader;

/// Initialize the rustls crypto provider once per process.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Certificate verifier that accepts every server certificate.
///
/// **DANGEROUS**: only installed when `tls_insecure` is set.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS connector over the system's native roots, or the accept-anything verifier.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector> {
    init_crypto_provider();

    if insecure {
        warn!("TLS certificate verification DISABLED (tls_insecure)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(Error::Tls(
            "No system root certificates found. Ensure CA certificates are installed \
            (e.g., ca-certificates package on Linux)."
                .to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| Error::Tls(format!("Failed to add cert: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn tls_handshake(tcp: TcpStream, tls_name: &str, insecure: bool) -> Result<TlsStream<TcpStream>> {
    let connector = create_tls_connector(insecure)?;
    let server_name = ServerName::try_from(tls_name.to_string())
        .map_err(|e| Error::Tls(format!("Invalid server name {}: {}", tls_name, e)))?;

    connector.connect(server_name, tcp).await.map_err(|e| {
        error!(tls_name, error = %e, "TLS handshake failed");
        Error::Tls(format!("TLS handshake failed with {}: {}", tls_name, e))
    })
}

/// Byte stream to the server, plain or encrypted.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A dialed connection with its decode cursor, used during negotiation.
pub struct Connection {
    transport: Transport,
    reader: StanzaReader,
    tls_name: String,
    insecure: bool,
}

impl Connection {
    /// Dial each endpoint in order, returning the first that connects.
    pub async fn dial(endpoints: &[Endpoint], connect_timeout: Duration, insecure: bool) -> Result<Self> {
        let mut last_error = Error::Connect("no endpoints to dial".to_string());
        for (index, endpoint) in endpoints.iter().enumerate() {
            match Self::dial_one(endpoint, connect_timeout, insecure).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(
                        host = %endpoint.host,
                        port = endpoint.port,
                        attempt = index + 1,
                        total = endpoints.len(),
                        error = %e,
                        "Endpoint unreachable"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn dial_one(endpoint: &Endpoint, connect_timeout: Duration, insecure: bool) -> Result<Self> {
        let started = std::time::Instant::now();
        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint.address()))
            .await
            .map_err(|_| {
                Error::Connect(format!(
                    "TCP connect timed out after {}s to {}",
                    connect_timeout.as_secs(),
                    endpoint.address()
                ))
            })?
            .map_err(|e| Error::Connect(format!("Failed to connect to {}: {}", endpoint.address(), e)))?;
        let _ = tcp.set_nodelay(true);

        let transport = match endpoint.mode {
            ConnectionMode::Tcp => Transport::Plain(tcp),
            ConnectionMode::DirectTls => {
                Transport::Tls(Box::new(tls_handshake(tcp, endpoint.tls_name(), insecure).await?))
            }
        };
        info!(
            host = %endpoint.host,
            port = endpoint.port,
            mode = ?endpoint.mode,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connected"
        );

        Ok(Self {
            transport,
            reader: StanzaReader::new(),
            tls_name: endpoint.tls_name().to_string(),
            insecure,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Wrap the socket in TLS. The decode cursor is rebuilt; bytes buffered
    /// before the upgrade are discarded.
    pub async fn upgrade_to_tls(self) -> Result<Self> {
        let tcp = match self.transport {
            Transport::Plain(tcp) => tcp,
            Transport::Tls(_) => return Err(Error::Protocol("stream is already encrypted".to_string())),
        };
        let tls = tls_handshake(tcp, &self.tls_name, self.insecure).await?;
        info!(tls_name = %self.tls_name, "STARTTLS upgrade complete");

        Ok(Self {
            transport: Transport::Tls(Box::new(tls)),
            reader: StanzaReader::new(),
            tls_name: self.tls_name,
            insecure: self.insecure,
        })
    }

    pub async fn send(&mut self, data: &str) -> Result<()> {
        debug!(data = %data, ">>");
        self.transport.write_all(data.as_bytes()).await?;
        self.transport.flush().await?;
        Ok(())
    }

    pub async fn next_element(&mut self) -> Result<Element> {
        self.reader.next_element(&mut self.transport).await
    }

    /// Split into independently owned read and write halves sharing one close signal.
    pub fn into_split(self) -> (ConnReader, ConnWriter) {
        let (read, write) = tokio::io::split(self.transport);
        let (tx, rx) = watch::channel(false);
        let close = CloseHandle { tx: Arc::new(tx) };
        (
            ConnReader {
                read,
                reader: self.reader,
                closed: rx,
            },
            ConnWriter { write, close },
        )
    }
}

/// Aborts the paired reader. Idempotent and callable from any task.
#[derive(Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Read half, owned by the dispatcher task.
pub struct ConnReader {
    read: ReadHalf<Transport>,
    reader: StanzaReader,
    closed: watch::Receiver<bool>,
}

impl ConnReader {
    /// Next top-level element, or `ConnectionClosed` once the close handle fired.
    pub async fn next_element(&mut self) -> Result<Element> {
        tokio::select! {
            result = self.reader.next_element(&mut self.read) => result,
            _ = self.closed.wait_for(|closed| *closed) => Err(Error::ConnectionClosed),
        }
    }
}

/// Write half. Callers serialize access through the client's write lock.
pub struct ConnWriter {
    write: WriteHalf<Transport>,
    close: CloseHandle,
}

impl ConnWriter {
    pub async fn send(&mut self, data: &str) -> Result<()> {
        if self.close.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        debug!(data = %data, ">>");
        self.write.write_all(data.as_bytes()).await?;
        self.write.flush().await?;
        Ok(())
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Send the stream close tag and shut the socket down.
    pub async fn shutdown(mut self) {
        self.close.close();
        let _ = self.write.write_all(b"</stream:stream>").await;
        let _ = self.write.shutdown().await;
    }
}
