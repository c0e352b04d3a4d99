//! TLS over TCP using rustls.
//!
//! Clients trust the server in one of three ways (see [`TrustMode`]):
//! the operating system's root store, a pinned SHA-256 thumbprint of the
//! leaf certificate, or nothing at all. Servers present a PEM certificate
//! chain and key.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};

use super::{Connector, Endpoint};
use crate::config::{ConnectionConfig, TaskConfig, TlsClientConfig, TlsServerConfig, TrustMode};
use crate::connection::Connection;
use crate::error::{Result, TaskwireError};
use crate::work::BoxFuture;

/// SHA-256 thumbprint of a DER certificate, lowercase hex.
pub fn thumbprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Lowercase, without the separators people paste from certificate viewers.
fn normalize_thumbprint(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: impl std::fmt::Display) -> TaskwireError {
    TaskwireError::Tls(e.to_string())
}

/// Accepts exactly one leaf certificate, identified by thumbprint.
/// Handshake signatures are still verified.
#[derive(Debug)]
struct ThumbprintVerifier {
    expected: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for ThumbprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = thumbprint(end_entity.as_ref());
        if actual == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(expected = %self.expected, actual = %actual, "Server certificate thumbprint mismatch");
            Err(rustls::Error::General(format!(
                "certificate thumbprint {} does not match",
                actual
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Accepts any certificate.
#[derive(Debug)]
struct UncheckedVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for UncheckedVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build a rustls client configuration for `config.trust`.
pub fn client_config(config: &TlsClientConfig) -> Result<ClientConfig> {
    let provider = provider();
    let algorithms = provider.signature_verification_algorithms;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let config = match &config.trust {
        TrustMode::SystemRoots => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                tracing::warn!(error = %error, "Could not load some native certificates");
            }
            let mut roots = RootCertStore::empty();
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            tracing::debug!(added, ignored, "Loaded native root certificates");
            if added == 0 {
                return Err(TaskwireError::Tls("no usable root certificates found".into()));
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TrustMode::Thumbprint(expected) => {
            let expected = normalize_thumbprint(expected);
            if expected.len() != 64 {
                return Err(TaskwireError::Config(format!(
                    "thumbprint must be 64 hex digits, got {}",
                    expected.len()
                )));
            }
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ThumbprintVerifier { expected, algorithms }))
                .with_no_client_auth()
        }
        TrustMode::Unchecked => {
            tracing::warn!("Server certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(UncheckedVerifier { algorithms }))
                .with_no_client_auth()
        }
    };
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TaskwireError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TaskwireError::Tls(format!("invalid PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TaskwireError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TaskwireError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TaskwireError::Tls(format!("invalid PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| TaskwireError::Tls(format!("no private key in {}", path.display())))
}

/// Build a rustls server configuration from PEM files.
pub fn server_config(config: &TlsServerConfig) -> Result<ServerConfig> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;
    tracing::info!(
        cert = %config.cert_path.display(),
        thumbprint = %thumbprint(certs[0].as_ref()),
        "Loaded server certificate"
    );
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_error)
}

/// Dials endpoints over TCP and performs the TLS handshake.
#[derive(Clone)]
pub struct TlsConnector {
    tls: tokio_rustls::TlsConnector,
    server_name: Option<String>,
    connection: ConnectionConfig,
}

impl TlsConnector {
    pub fn new(tls: &TlsClientConfig, connection: ConnectionConfig) -> Result<Self> {
        connection.validate()?;
        Ok(Self {
            tls: tokio_rustls::TlsConnector::from(Arc::new(client_config(tls)?)),
            server_name: tls.server_name.clone(),
            connection,
        })
    }

    /// Connector for a task client: its `tls` trust and `connection` settings.
    pub fn from_task_config(config: &TaskConfig) -> Result<Self> {
        Self::new(&config.tls, config.connection.clone())
    }

    async fn dial(&self, endpoint: &str) -> Result<Connection> {
        let parsed: Endpoint = endpoint.parse()?;
        let name = self.server_name.clone().unwrap_or(parsed.host);
        let server_name = ServerName::try_from(name.clone())
            .map_err(|e| TaskwireError::Config(format!("invalid server name '{}': {}", name, e)))?;

        let tcp = TcpStream::connect(endpoint).await?;
        tcp.set_nodelay(true)?;
        let stream = self.tls.connect(server_name, tcp).await.map_err(tls_error)?;
        tracing::debug!(endpoint, "TLS session established");

        Ok(Connection::builder(self.connection.clone())
            .peer(endpoint)
            .start(stream))
    }
}

impl Connector for TlsConnector {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(self.dial(endpoint))
    }
}

/// TCP listener that yields TLS connections.
pub struct TlsListener {
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    connection: ConnectionConfig,
}

impl TlsListener {
    pub async fn bind(addr: &str, tls: &TlsServerConfig, connection: ConnectionConfig) -> Result<Self> {
        connection.validate()?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config(tls)?));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Listening");
        Ok(Self {
            listener,
            acceptor,
            connection,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next TCP connection. The handshake runs in
    /// [`Incoming::establish`] so a slow client does not hold up the loop.
    pub async fn accept(&self) -> Result<Incoming> {
        let (tcp, peer) = self.listener.accept().await?;
        tcp.set_nodelay(true)?;
        Ok(Incoming {
            tcp,
            peer,
            acceptor: self.acceptor.clone(),
            connection: self.connection.clone(),
        })
    }
}

/// An accepted TCP connection awaiting its TLS handshake.
pub struct Incoming {
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: tokio_rustls::TlsAcceptor,
    connection: ConnectionConfig,
}

impl Incoming {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn establish(self) -> Result<Connection> {
        let stream = self.acceptor.accept(self.tcp).await.map_err(tls_error)?;
        Ok(Connection::builder(self.connection)
            .passive_channels(true)
            .peer(self.peer.to_string())
            .start(stream))
    }
}
