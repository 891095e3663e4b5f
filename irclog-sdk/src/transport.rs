//! Buffered byte transport over TCP, optionally wrapped in TLS.
//!
//! The transport never blocks on `send`: bytes are appended to an outgoing
//! buffer and written out by [`Transport::tick`], which performs one bounded
//! readiness wait per call.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

use crate::error::Error;

/// Default upper bound on the readiness wait in [`Transport::tick`].
pub const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes read from the socket per tick.
pub const READ_CHUNK: usize = 4096;

/// Per-address connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How to secure the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Plain,
    /// TLS with certificate verification against the webpki roots.
    Verified,
    /// TLS without certificate verification (self-signed servers).
    Insecure,
}

/// Anything the transport can drive: TCP, TLS, or an in-memory duplex.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> ByteStream for T {}

struct Link {
    reader: ReadHalf<Box<dyn ByteStream>>,
    writer: WriteHalf<Box<dyn ByteStream>>,
}

enum Ready {
    Read(usize),
    Wrote(usize),
    Idle,
}

pub struct Transport {
    link: Option<Link>,
    outgoing: Vec<u8>,
    incoming: Vec<u8>,
}

impl Transport {
    /// A transport with no socket. `is_connected` is false.
    pub fn disconnected() -> Self {
        Self {
            link: None,
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }

    /// Wrap an already established stream.
    pub fn from_stream<S: ByteStream + 'static>(stream: S) -> Self {
        let stream: Box<dyn ByteStream> = Box::new(stream);
        let (reader, writer) = tokio::io::split(stream);
        Self {
            link: Some(Link { reader, writer }),
            ..Self::disconnected()
        }
    }

    /// Resolve `host` and try each candidate address in resolver order,
    /// returning on the first one that connects (and completes TLS, if asked).
    ///
    /// Failure is not an error: the transport is simply left disconnected and
    /// the caller is expected to check [`Transport::is_connected`].
    pub async fn connect(host: &str, port: u16, tls: TlsMode) -> Self {
        let addrs = match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(%host, port, error = %e, "Could not resolve host");
                return Self::disconnected();
            }
        };

        for addr in addrs {
            let tcp = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(tcp)) => tcp,
                Ok(Err(e)) => {
                    tracing::debug!(%addr, error = %e, "TCP connect failed");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(%addr, "TCP connect timed out");
                    continue;
                }
            };

            if tls == TlsMode::Plain {
                tracing::info!(%addr, "Connected (plain)");
                return Self::from_stream(tcp);
            }

            match tls_handshake(host, tcp, tls).await {
                Ok(stream) => {
                    tracing::info!(%addr, "Connected (TLS)");
                    return Self::from_stream(stream);
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "TLS handshake failed");
                }
            }
        }

        tracing::warn!(%host, port, "No address accepted the connection");
        Self::disconnected()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Queue bytes for sending. Returns false if there is no socket.
    pub fn send(&mut self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outgoing.extend_from_slice(data);
        true
    }

    /// Wait at most `timeout` for the socket to become readable, or writable
    /// while output is pending, and service whichever is ready first. A
    /// write is followed by a flush bounded by the same `timeout`.
    ///
    /// A zero-length read means the peer closed; the transport disconnects
    /// and returns `Ok`. The next caller sees `is_connected() == false`.
    pub async fn tick(&mut self, timeout: Duration) -> Result<(), Error> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };

        let mut chunk = [0u8; READ_CHUNK];
        let outgoing = &self.outgoing;
        let ready = tokio::select! {
            biased;
            result = link.writer.write(outgoing), if !outgoing.is_empty() => Ready::Wrote(result?),
            result = link.reader.read(&mut chunk) => Ready::Read(result?),
            () = tokio::time::sleep(timeout) => Ready::Idle,
        };

        match ready {
            Ready::Wrote(n) => {
                self.outgoing.drain(..n);
                // TLS flushes wait on the socket; a stalled peer must not hold
                // the tick past its bound.
                match tokio::time::timeout(timeout, link.writer.flush()).await {
                    Ok(flushed) => flushed?,
                    Err(_) => tracing::debug!(?timeout, "Flush still pending"),
                }
            }
            Ready::Read(0) => {
                tracing::debug!("Peer closed the connection");
                self.disconnect();
            }
            Ready::Read(n) => self.incoming.extend_from_slice(&chunk[..n]),
            Ready::Idle => {}
        }
        Ok(())
    }

    /// The buffered incoming bytes, not yet consumed.
    pub fn peek(&self) -> &[u8] {
        &self.incoming
    }

    /// Consume `amount` bytes from the head of the incoming buffer.
    pub fn discard(&mut self, amount: usize) {
        let amount = amount.min(self.incoming.len());
        self.incoming.drain(..amount);
    }

    /// Take everything buffered so far.
    pub fn receive(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.incoming)
    }

    pub fn pending_output(&self) -> usize {
        self.outgoing.len()
    }

    /// Close the socket. Safe to call more than once.
    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            self.outgoing.clear();
        }
    }
}

async fn tls_handshake(
    host: &str,
    tcp: TcpStream,
    mode: TlsMode,
) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tls_config = if mode == TlsMode::Insecure {
        rustls_insecure_config()
    } else {
        rustls_default_config()
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let dns_name = rustls::pki_types::ServerName::try_from(host.to_string())?;
    Ok(connector.connect(dns_name, tcp).await?)
}

fn rustls_default_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
