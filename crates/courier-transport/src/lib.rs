// TLS transport for the push gateway and feedback endpoints.
//
// The transport hands out raw byte streams with TCP semantics: writes are
// not message-atomic and reads may return short. All framing discipline
// lives with the caller.
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("endpoint host {0:?} is not a valid TLS server name")]
    InvalidHost(String),
    #[error("connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: io::Error,
    },
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout {
        endpoint: String,
        timeout: Duration,
    },
    #[error("TLS handshake with {endpoint}: {source}")]
    Handshake {
        endpoint: String,
        source: io::Error,
    },
    #[error("TLS identity rejected: {0}")]
    Identity(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Client identity presented during the TLS handshake: the push certificate
/// chain and its private key. Supplied by the caller's identity store.
pub struct ClientIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The gateway/feedback address pair. Replaced as a unit via the client's
/// `configure`.
///
/// ```
/// use courier_transport::Endpoints;
///
/// let sandbox = Endpoints::sandbox();
/// assert_eq!(sandbox.gateway.port, 2195);
/// assert_eq!(sandbox.feedback.port, 2196);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub gateway: Endpoint,
    pub feedback: Endpoint,
}

impl Endpoints {
    /// The sandbox environment for development builds.
    pub fn sandbox() -> Self {
        Self {
            gateway: Endpoint::new("gateway.sandbox.push.apple.com", 2195),
            feedback: Endpoint::new("feedback.sandbox.push.apple.com", 2196),
        }
    }

    /// The production environment for live applications.
    pub fn production() -> Self {
        Self {
            gateway: Endpoint::new("gateway.push.apple.com", 2195),
            feedback: Endpoint::new("feedback.push.apple.com", 2196),
        }
    }

    /// A dummy environment on the local host, for debugging against a
    /// cooperating fake.
    pub fn local() -> Self {
        Self {
            gateway: Endpoint::new("localhost", 2195),
            feedback: Endpoint::new("localhost", 2196),
        }
    }
}

/// Transport-level configuration defaults.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
        }
    }
}

/// Connector that produces mutually-authenticated TLS sessions.
///
/// The rustls client configuration is built once from the identity and
/// trust anchors; replacing either means building a new transport.
pub struct TlsTransport {
    connector: TlsConnector,
    config: TransportConfig,
}

impl TlsTransport {
    pub fn new(
        identity: ClientIdentity,
        roots: RootCertStore,
        config: TransportConfig,
    ) -> Result<Self> {
        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(identity.cert_chain, identity.key)?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls)),
            config,
        })
    }

    /// Resolve, connect, and complete the TLS handshake with `endpoint`.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<TlsSession> {
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|_| Error::InvalidHost(endpoint.host.clone()))?;
        let tcp = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| Error::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout: self.config.connect_timeout,
        })?
        .map_err(|source| Error::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;
        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|source| Error::Handshake {
                endpoint: endpoint.to_string(),
                source,
            })?;
        debug!(endpoint = %endpoint, "TLS session established");
        Ok(TlsSession {
            stream: Some(stream),
            endpoint: endpoint.clone(),
        })
    }
}

/// One live TLS session. Single owner; not shareable between tasks.
#[derive(Debug)]
pub struct TlsSession {
    stream: Option<TlsStream<TcpStream>>,
    endpoint: Endpoint,
}

impl TlsSession {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write all of `bytes`, blocking until the transport accepts them.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream_mut()?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read into `buf`. Short reads are expected; `Ok(0)` means the peer
    /// closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read = self.stream_mut()?.read(buf).await?;
        Ok(read)
    }

    /// Close the session. Safe to call more than once; the TLS shutdown is
    /// best effort since the peer may already be gone.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(endpoint = %self.endpoint, error = %err, "TLS shutdown failed");
            }
            debug!(endpoint = %self.endpoint, "TLS session closed");
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TlsStream<TcpStream>> {
        self.stream.as_mut().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is closed",
            ))
        })
    }
}
