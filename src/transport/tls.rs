//! TLS transport over rustls.
//!
//! Server certificate checking is an explicit choice, never a silent default:
//! - `Disabled`: no certificate validation at all. Devices without a trusted
//!   root store run this way; every connect logs a warning.
//! - `WebPkiRoots`: validate against the bundled Mozilla roots.
//! - `CustomCa`: validate against a PEM bundle supplied by the operator.

use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{ByteChannel, ChannelRead, Connector};

/// How the server's certificate chain is checked.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// No certificate validation. Traffic is encrypted but the peer is unauthenticated.
    #[default]
    Disabled,
    WebPkiRoots,
    /// PEM-encoded CA certificates.
    CustomCa(Vec<u8>),
}

impl TlsVerification {
    /// Load a PEM CA bundle from disk.
    pub fn custom_ca(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read TLS CA bundle '{}'", path.display()))?;
        Ok(Self::CustomCa(pem))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl FromStr for TlsVerification {
    type Err = anyhow::Error;

    /// `disabled`, `webpki`, or `ca:<path>`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Some(path) = trimmed.strip_prefix("ca:") {
            return Self::custom_ca(Path::new(path));
        }
        match trimmed.to_lowercase().as_str() {
            "disabled" | "none" | "insecure" | "no-verify" => Ok(Self::Disabled),
            "webpki" | "webpki-roots" | "verify" => Ok(Self::WebPkiRoots),
            other => Err(anyhow!(
                "unknown TLS verification mode '{}': expected 'disabled', 'webpki' or 'ca:<path>'",
                other
            )),
        }
    }
}

impl std::fmt::Display for TlsVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled (no certificate validation)"),
            Self::WebPkiRoots => write!(f, "webpki-roots"),
            Self::CustomCa(_) => write!(f, "custom-ca"),
        }
    }
}

/// Opens rustls client connections with a bounded connect + handshake.
pub struct TlsConnector {
    config: Arc<ClientConfig>,
    verification: TlsVerification,
}

impl TlsConnector {
    pub fn new(verification: TlsVerification) -> Result<Self> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!("failed to configure TLS versions: {}", e))?;

        let config = match &verification {
            TlsVerification::Disabled => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new(
                    provider,
                )))
                .with_no_client_auth(),
            TlsVerification::WebPkiRoots => {
                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
            TlsVerification::CustomCa(pem) => {
                let mut root_store = rustls::RootCertStore::empty();
                let certs = rustls_pemfile::certs(&mut pem.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| anyhow!("failed to parse CA certificate from PEM: {}", e))?;
                if certs.is_empty() {
                    return Err(anyhow!("CA bundle contains no certificates"));
                }
                for cert in certs {
                    root_store
                        .add(cert)
                        .map_err(|e| anyhow!("failed to add CA certificate: {}", e))?;
                }
                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
        };

        Ok(Self {
            config: Arc::new(config),
            verification,
        })
    }

    pub fn verification(&self) -> &TlsVerification {
        &self.verification
    }
}

impl Connector for TlsConnector {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Box<dyn ByteChannel>> {
        if self.verification.is_disabled() {
            log::warn!(
                "connecting to {}:{} with TLS certificate validation disabled",
                host,
                port
            );
        }

        let addrs = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}:{}", host, port))?;
        let mut last_err = None;
        let mut sock = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    sock = Some(stream);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let mut sock = match (sock, last_err) {
            (Some(sock), _) => sock,
            (None, Some(err)) => {
                return Err(err).with_context(|| format!("failed to connect to {}:{}", host, port))
            }
            (None, None) => return Err(anyhow!("{}:{} resolved to no addresses", host, port)),
        };
        sock.set_nodelay(true)?;
        sock.set_read_timeout(Some(timeout))?;
        sock.set_write_timeout(Some(timeout))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| anyhow!("invalid TLS server name '{}': {}", host, e))?;
        let mut conn = ClientConnection::new(self.config.clone(), server_name)
            .map_err(|e| anyhow!("failed to start TLS session: {}", e))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)
                .with_context(|| format!("TLS handshake with {}:{} failed", host, port))?;
        }
        log::debug!("TLS session established with {}:{}", host, port);

        Ok(Box::new(TlsChannel {
            stream: StreamOwned::new(conn, sock),
        }))
    }

    fn describe(&self) -> String {
        format!("tls (verification: {})", self.verification)
    }
}

struct TlsChannel {
    stream: StreamOwned<ClientConnection, TcpStream>,
}

impl Write for TlsChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl ByteChannel for TlsChannel {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ChannelRead> {
        // A zero read timeout is rejected by the socket layer.
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream.sock.set_read_timeout(Some(timeout))?;
        match self.stream.read(buf) {
            Ok(0) => Ok(ChannelRead::Closed),
            Ok(n) => Ok(ChannelRead::Data(n)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(ChannelRead::Idle)
            }
            // Peers that drop the TCP connection without close_notify.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(ChannelRead::Closed),
            Err(err) => Err(err),
        }
    }
}

impl Drop for TlsChannel {
    fn drop(&mut self) {
        self.stream.conn.send_close_notify();
        let _ = self.stream.conn.write_tls(&mut self.stream.sock);
    }
}

/// Accepts any server certificate. Handshake signatures are still checked so
/// the session keys belong to whoever presented the certificate.
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_from_str() {
        assert_eq!(
            "disabled".parse::<TlsVerification>().unwrap(),
            TlsVerification::Disabled
        );
        assert_eq!(
            "INSECURE".parse::<TlsVerification>().unwrap(),
            TlsVerification::Disabled
        );
        assert_eq!(
            "webpki".parse::<TlsVerification>().unwrap(),
            TlsVerification::WebPkiRoots
        );
        assert!("maybe".parse::<TlsVerification>().is_err());
        assert!("ca:/nonexistent/ca.pem".parse::<TlsVerification>().is_err());
    }

    #[test]
    fn default_is_explicitly_disabled() {
        let verification = TlsVerification::default();
        assert!(verification.is_disabled());
        assert!(verification.to_string().contains("no certificate validation"));
    }

    #[test]
    fn connectors_build_for_builtin_modes() {
        assert!(TlsConnector::new(TlsVerification::Disabled).is_ok());
        assert!(TlsConnector::new(TlsVerification::WebPkiRoots).is_ok());
    }

    #[test]
    fn custom_ca_requires_certificates() {
        let result = TlsConnector::new(TlsVerification::CustomCa(b"not a pem".to_vec()));
        assert!(result.is_err());
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connector = TlsConnector::new(TlsVerification::Disabled).unwrap();
        assert!(connector
            .connect("127.0.0.1", port, Duration::from_millis(500))
            .is_err());
    }
}
