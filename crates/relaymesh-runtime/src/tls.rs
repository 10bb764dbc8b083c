//! TLS upgrade for a backend connection, entered after `BackendProto`
//! raises `NeedsTlsUpgrade` following a cleartext SSLRequest.
//!
//! MySQL's own SSL modes (`REQUIRED`, as opposed to `VERIFY_CA`) encrypt
//! the wire without authenticating the server's certificate against a
//! trust store; that's the posture this module gives a backend
//! connection, since the proxy has no per-deployment CA bundle to pin
//! against. A future `VERIFY_CA` mode would swap the verifier below for
//! one built from a configured root store.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::error::{RuntimeError, RuntimeResult};

/// Either a plain or TLS-wrapped backend socket. Starts `Plain`; a
/// successful `upgrade` replaces it with `Tls` in place, so the rest of
/// the session code never has to know which one it's holding.
pub enum BackendTransport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient placeholder only ever observed mid-`upgrade`.
    Closed,
}

impl BackendTransport {
    pub fn plain(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf).await,
            Self::Tls(s) => s.read(buf).await,
            Self::Closed => Err(io::Error::new(io::ErrorKind::NotConnected, "backend stream closed")),
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.write_all(buf).await,
            Self::Tls(s) => s.write_all(buf).await,
            Self::Closed => Err(io::Error::new(io::ErrorKind::NotConnected, "backend stream closed")),
        }
    }

    /// Replace a plain stream with a TLS-wrapped one in place. Errors
    /// (and leaves the transport `Closed`) if called twice.
    pub async fn upgrade(&mut self, server_address: &str) -> RuntimeResult<()> {
        let current = std::mem::replace(self, Self::Closed);
        let Self::Plain(stream) = current else {
            return Err(RuntimeError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "backend stream is not plain, cannot upgrade to TLS",
            )));
        };
        let connector = TlsConnector::from(client_config());
        let name = server_name(server_address);
        let tls_stream = connector.connect(name, stream).await?;
        *self = Self::Tls(Box::new(tls_stream));
        Ok(())
    }
}

fn client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder_with_provider(
        tokio_rustls::rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .expect("ring provider supports the default protocol versions")
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoServerVerification))
    .with_no_client_auth();
    Arc::new(config)
}

fn server_name(address: &str) -> ServerName<'static> {
    if let Ok(ip) = address.parse() {
        return ServerName::IpAddress(ip);
    }
    ServerName::try_from(address.to_string())
        .unwrap_or_else(|_| ServerName::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST).into()))
}

#[derive(Debug)]
struct NoServerVerification;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        tokio_rustls::rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_address_parses_as_server_name() {
        assert!(matches!(server_name("10.0.0.5"), ServerName::IpAddress(_)));
    }

    #[test]
    fn hostname_parses_as_dns_server_name() {
        assert!(matches!(server_name("db1.internal"), ServerName::DnsName(_)));
    }
}
