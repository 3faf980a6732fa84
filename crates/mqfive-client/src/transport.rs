//! Byte-stream transports: plain TCP, TLS over TCP, and WebSocket over either.
//!
//! The event loop talks to any `AsyncRead + AsyncWrite` stream. A
//! [`Connector`] opens a fresh one for every connection attempt.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::ClientConfig;
#[cfg(feature = "tls")]
use crate::config::TlsConfig;
use crate::error::{ClientError, Result};

/// A connected, reliable, ordered byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedTransport>> + Send + 'a>>;

/// Opens transports for the event loop.
pub trait Connector: Send {
    fn connect(&mut self) -> ConnectFuture<'_>;
}

/// Connects over TCP, wrapped in TLS when `tls.enabled` is set and upgraded
/// to WebSocket when `websocket.enabled` is set.
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
    websocket_url: Option<String>,
    #[cfg(feature = "tls")]
    tls: Option<TlsSettings>,
}

#[cfg(feature = "tls")]
struct TlsSettings {
    config: TlsConfig,
    host: String,
    /// Built on first use and reused for reconnections.
    connector: Option<tokio_rustls::TlsConnector>,
}

impl TcpConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            address: config.address.clone(),
            connect_timeout: config.connect_timeout,
            websocket_url: config
                .websocket
                .enabled
                .then(|| config.websocket_url()),
            #[cfg(feature = "tls")]
            tls: config.tls.enabled.then(|| TlsSettings {
                config: config.tls.clone(),
                host: config.host().to_string(),
                connector: None,
            }),
        }
    }

    async fn open(&mut self) -> Result<BoxedTransport> {
        let tcp_stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.address),
        )
        .await
        .map_err(|_| ClientError::ConnectionTimeout)??;

        tcp_stream.set_nodelay(true)?;
        log::debug!("TCP connected to {}", self.address);

        #[cfg(feature = "tls")]
        if let Some(tls) = &mut self.tls {
            let stream = tls.wrap(tcp_stream, self.connect_timeout).await?;
            return self.finish(stream).await;
        }

        self.finish(tcp_stream).await
    }

    /// Box the stream, running the WebSocket upgrade first when configured.
    async fn finish<S: Transport + 'static>(&self, stream: S) -> Result<BoxedTransport> {
        let Some(url) = &self.websocket_url else {
            return Ok(Box::new(stream));
        };

        #[cfg(feature = "websocket")]
        {
            let ws = tokio::time::timeout(
                self.connect_timeout,
                crate::websocket::handshake(url, stream),
            )
            .await
            .map_err(|_| ClientError::ConnectionTimeout)??;
            Ok(Box::new(ws))
        }

        #[cfg(not(feature = "websocket"))]
        {
            drop(stream);
            Err(ClientError::Config(format!(
                "{} requires the websocket feature",
                url
            )))
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> ConnectFuture<'_> {
        Box::pin(self.open())
    }
}

#[cfg(feature = "tls")]
impl TlsSettings {
    async fn wrap(
        &mut self,
        tcp_stream: TcpStream,
        timeout: Duration,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        use std::sync::Arc;

        use rustls::pki_types::ServerName;

        let connector = match &self.connector {
            Some(c) => c.clone(),
            None => {
                let tls_config = build_tls_config(&self.config)?;
                let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
                self.connector = Some(connector.clone());
                connector
            }
        };

        let hostname = self.config.server_name.as_deref().unwrap_or(&self.host);
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| ClientError::Tls(format!("Invalid server name: {}", hostname)))?;

        tokio::time::timeout(timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| ClientError::ConnectionTimeout)?
            .map_err(|e| ClientError::Tls(e.to_string()))
    }
}

/// Build a rustls ClientConfig from TlsConfig.
#[cfg(feature = "tls")]
pub fn build_tls_config(config: &TlsConfig) -> Result<rustls::ClientConfig> {
    use std::fs::File;
    use std::io::BufReader;
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use rustls::RootCertStore;

    // Handle insecure mode (accept any certificate)
    if config.accept_invalid_certs {
        log::warn!("TLS certificate verification is disabled");
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
            .with_no_client_auth();
        return Ok(tls_config);
    }

    let mut root_store = RootCertStore::empty();

    if let Some(ca_path) = &config.ca_cert {
        let file = File::open(ca_path)
            .map_err(|e| ClientError::Tls(format!("Failed to open CA cert: {}", e)))?;
        let mut reader = BufReader::new(file);

        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Tls(format!("Failed to parse CA cert: {}", e)))?;
        if certs.is_empty() {
            return Err(ClientError::Tls(format!(
                "No certificates found in {}",
                ca_path.display()
            )));
        }

        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("Failed to add CA cert: {}", e)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

    // Mutual TLS
    let tls_config = if let (Some(cert_path), Some(key_path)) =
        (&config.client_cert, &config.client_key)
    {
        let cert_file = File::open(cert_path)
            .map_err(|e| ClientError::Tls(format!("Failed to open client cert: {}", e)))?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Tls(format!("Failed to parse client cert: {}", e)))?;

        let key_file = File::open(key_path)
            .map_err(|e| ClientError::Tls(format!("Failed to open client key: {}", e)))?;
        let mut key_reader = BufReader::new(key_file);
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| ClientError::Tls(format!("Failed to parse client key: {}", e)))?
            .ok_or_else(|| ClientError::Tls("No private key found in file".to_string()))?;

        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClientError::Tls(format!("Failed to configure client auth: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(tls_config)
}

/// Danger: A certificate verifier that accepts any certificate.
/// Only use for testing with self-signed certificates.
#[cfg(feature = "tls")]
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}
