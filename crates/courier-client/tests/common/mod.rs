#![allow(dead_code)]
// Shared fixtures: a throwaway PKI plus fake gateway and feedback servers
// speaking the real wire protocol over mutual TLS.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_client::{Client, ClientIdentity, ClientOptions, Endpoint, Endpoints};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

pub struct TestPki {
    ca_der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
    client_der: CertificateDer<'static>,
    client_key: Vec<u8>,
}

impl TestPki {
    pub fn new() -> Self {
        let mut ca_params = CertificateParams::new(vec![]);
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "courier test ca");
        let ca = Certificate::from_params(ca_params).expect("generate ca");
        let ca_der = CertificateDer::from(ca.serialize_der().expect("ca der"));

        let server = Certificate::from_params(CertificateParams::new(vec!["127.0.0.1".into()]))
            .expect("generate server cert");
        let server_der =
            CertificateDer::from(server.serialize_der_with_signer(&ca).expect("sign server"));
        let server_key = server.serialize_private_key_der();

        let client = Certificate::from_params(CertificateParams::new(vec![]))
            .expect("generate client cert");
        let client_der =
            CertificateDer::from(client.serialize_der_with_signer(&ca).expect("sign client"));
        let client_key = client.serialize_private_key_der();

        let mut client_roots = RootCertStore::empty();
        client_roots.add(ca_der.clone()).expect("add ca root");
        let verifier = WebPkiClientVerifier::builder(Arc::new(client_roots))
            .build()
            .expect("client verifier");
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                vec![server_der],
                PrivatePkcs8KeyDer::from(server_key).into(),
            )
            .expect("server config");

        Self {
            ca_der,
            server_config: Arc::new(server_config),
            client_der,
            client_key,
        }
    }

    pub fn client_identity(&self) -> ClientIdentity {
        ClientIdentity {
            cert_chain: vec![self.client_der.clone()],
            key: PrivatePkcs8KeyDer::from(self.client_key.clone()).into(),
        }
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).expect("add ca root");
        roots
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

pub fn endpoints(gateway_port: u16, feedback_port: u16) -> Endpoints {
    Endpoints {
        gateway: Endpoint::new("127.0.0.1", gateway_port),
        feedback: Endpoint::new("127.0.0.1", feedback_port),
    }
}

// Port 1 never has a listener; tests that exercise only one service leave
// the other side pointed there.
pub fn gateway_endpoints(port: u16) -> Endpoints {
    endpoints(port, 1)
}

pub fn feedback_endpoints(port: u16) -> Endpoints {
    endpoints(1, port)
}

pub fn client(pki: &TestPki, endpoints: Endpoints, options: ClientOptions) -> Client {
    Client::new(pki.client_identity(), pki.roots(), endpoints, options).expect("client")
}

pub enum GatewayMode {
    /// Read notification frames and forward them; keep connections open.
    Collect,
    /// After each received frame, write `response` and close the connection.
    RespondAndClose { response: [u8; 6] },
    /// Kill the first `failures` connections before the TLS handshake
    /// completes, then behave like `Collect`.
    RejectHandshakes { failures: usize },
}

pub struct FakeGateway {
    pub port: u16,
    pub frames: mpsc::UnboundedReceiver<Vec<u8>>,
    pub connections: Arc<AtomicUsize>,
}

pub async fn spawn_gateway(pki: &TestPki, mode: GatewayMode) -> FakeGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let port = listener.local_addr().expect("gateway addr").port();
    let acceptor = pki.acceptor();
    let (frame_tx, frames) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let conn_counter = connections.clone();

    tokio::spawn(async move {
        let mut pending_failures = match &mode {
            GatewayMode::RejectHandshakes { failures } => *failures,
            _ => 0,
        };
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            if pending_failures > 0 {
                pending_failures -= 1;
                drop(tcp);
                continue;
            }
            let Ok(mut stream) = acceptor.accept(tcp).await else {
                continue;
            };
            conn_counter.fetch_add(1, Ordering::SeqCst);
            match &mode {
                GatewayMode::RespondAndClose { response } => {
                    if let Some(frame) = read_notification(&mut stream).await {
                        let _ = frame_tx.send(frame);
                    }
                    let _ = stream.write_all(response).await;
                    let _ = stream.shutdown().await;
                }
                _ => {
                    while let Some(frame) = read_notification(&mut stream).await {
                        let _ = frame_tx.send(frame);
                    }
                }
            }
        }
    });

    FakeGateway {
        port,
        frames,
        connections,
    }
}

/// Read one complete notification frame, or `None` when the client closes.
async fn read_notification(stream: &mut TlsStream<TcpStream>) -> Option<Vec<u8>> {
    let mut header = [0u8; 11];
    stream.read_exact(&mut header).await.ok()?;
    let token_len = u16::from_be_bytes([header[9], header[10]]) as usize;
    let mut token = vec![0u8; token_len];
    stream.read_exact(&mut token).await.ok()?;
    let mut payload_len_bytes = [0u8; 2];
    stream.read_exact(&mut payload_len_bytes).await.ok()?;
    let mut payload = vec![0u8; u16::from_be_bytes(payload_len_bytes) as usize];
    stream.read_exact(&mut payload).await.ok()?;

    let mut frame = header.to_vec();
    frame.extend(token);
    frame.extend(payload_len_bytes);
    frame.extend(payload);
    Some(frame)
}

/// Serve the feedback protocol: write each chunk (pausing between them so
/// they arrive as separate reads), then close. Accepts connections until
/// the test ends.
pub async fn spawn_feedback(pki: &TestPki, chunks: Vec<Vec<u8>>, chunk_delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind feedback");
    let port = listener.local_addr().expect("feedback addr").port();
    let acceptor = pki.acceptor();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut stream) = acceptor.accept(tcp).await else {
                continue;
            };
            for chunk in &chunks {
                tokio::time::sleep(chunk_delay).await;
                if stream.write_all(chunk).await.is_err() {
                    break;
                }
                let _ = stream.flush().await;
            }
            let _ = stream.shutdown().await;
        }
    });

    port
}

pub fn feedback_record(timestamp: u32, token_byte: u8) -> Vec<u8> {
    let mut record = timestamp.to_be_bytes().to_vec();
    record.extend_from_slice(&32u16.to_be_bytes());
    record.extend_from_slice(&[token_byte; 32]);
    record
}
