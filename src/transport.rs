//! Link transport
//!
//! One TLS connection to a guard (or directly to a relay for one-hop use).
//! The TLS layer deliberately performs no certificate-chain validation:
//! trust comes from the in-band CERTS cell, so the verifier accepts any
//! peer certificate and the Tor layer checks it against the relay's RSA
//! identity afterwards.
//!
//! The [`LinkTransport`] contract surfaces what the Tor layer needs from
//! TLS: the raw peer certificate and, when the backend can export them,
//! the TLS 1.2 session randoms and master secret for link authentication.

use crate::error::{Result, TorError};
use rustls_pki_types::ServerName;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// TLS 1.2 session material for the AUTHENTICATE cell.
#[derive(Clone)]
pub struct TlsAuthMaterial {
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    pub master_secret: Vec<u8>,
}

/// A byte stream to a relay plus the TLS facts the link handshake needs.
pub trait LinkTransport: AsyncRead + AsyncWrite + Unpin + Send {
    /// The peer's TLS certificate, DER-encoded.
    fn peer_cert_der(&self) -> Option<Vec<u8>>;

    /// TLS 1.2 session secrets, when the backend exposes them. Without
    /// them the link handshake completes as an unauthenticated initiator.
    fn auth_material(&self) -> Option<TlsAuthMaterial>;
}

pub type BoxTransport = Box<dyn LinkTransport>;

/// Opens transports to relays. Mocked in tests; TLS in production.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<BoxTransport>> + Send + 'a>>;
}

/// Certificate verifier that accepts everything. The CERTS cell is the
/// real check; see the module docs.
#[derive(Debug)]
struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// A live TLS link to a relay.
pub struct TlsLink {
    stream: TlsStream<TcpStream>,
}

impl LinkTransport for TlsLink {
    fn peer_cert_der(&self) -> Option<Vec<u8>> {
        let (_, conn) = self.stream.get_ref();
        conn.peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }

    fn auth_material(&self) -> Option<TlsAuthMaterial> {
        // rustls keeps the TLS 1.2 master secret internal, so this backend
        // cannot authenticate the link; relays accept unauthenticated
        // initiators.
        None
    }
}

impl AsyncRead for TlsLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Dialer producing [`TlsLink`]s with TLS 1.2 enabled and certificate
/// verification disabled.
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new() -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .expect("ring provider supports TLS 1.2 and 1.3")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();

        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer for TlsDialer {
    fn dial<'a>(
        &'a self,
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = Result<BoxTransport>> + Send + 'a>> {
        Box::pin(async move {
            let tcp = TcpStream::connect(addr)
                .await
                .map_err(|e| TorError::ConnectionFailed(e.to_string()))?;
            tcp.set_nodelay(true).ok();

            let server_name = ServerName::IpAddress(addr.ip().into());
            let stream = self
                .connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TorError::Tls(e.to_string()))?;

            log::debug!("🔗 TLS link established to {}", addr);
            Ok(Box::new(TlsLink { stream }) as BoxTransport)
        })
    }
}
