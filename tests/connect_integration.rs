//! End-to-end connection tests
//!
//! Each test runs an in-process OpenSSL server on 127.0.0.1 and connects to
//! it through the public `Connector` API. Certificates are minted per test.

#[path = "../src/tls/test_pki.rs"]
mod test_pki;

use hsm_tls::net::{self, ServerInfo, Sockets, TcpSockets};
use hsm_tls::tls::{
    Connection, Connector, Credentials, SoftKeyStore, Status, TlsError, TransportConfig,
};
use openssl::ssl::{self, AlpnError, SslAcceptor, SslMethod, SslVerifyMode};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use test_pki::EcIdentity;

const MQTT_ALPN: &[u8] = b"\x0ex-amzn-mqtt-ca";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Root CA, server and client identities, with the PEM files the client reads
struct Pki {
    _dir: TempDir,
    ca: EcIdentity,
    server: EcIdentity,
    client: EcIdentity,
    root_path: PathBuf,
    client_cert_path: PathBuf,
}

fn pki() -> Pki {
    let dir = tempfile::tempdir().unwrap();
    let ca = test_pki::root_ca("Test Root");
    let server = test_pki::leaf(&ca, "test-server", &["localhost", "127.0.0.1"]);
    let client = test_pki::leaf(&ca, "device-1", &[]);
    let root_path = test_pki::write_certs(dir.path(), "root.pem", &[&ca.cert]);
    let client_cert_path = test_pki::write_certs(dir.path(), "device.pem", &[&client.cert]);

    Pki {
        _dir: dir,
        ca,
        server,
        client,
        root_path,
        client_cert_path,
    }
}

#[derive(Default)]
struct ServerOptions {
    require_client_cert: bool,
    alpn: Option<&'static [u8]>,
}

/// What the server saw
#[derive(Debug)]
struct ServerReport {
    client_subject: Option<String>,
    received: Vec<u8>,
}

/// Accept one TLS connection and echo everything until the client closes
fn spawn_server(
    ca: &EcIdentity,
    identity: &EcIdentity,
    options: ServerOptions,
) -> (u16, JoinHandle<Result<ServerReport, String>>) {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    acceptor.set_private_key(&identity.key).unwrap();
    acceptor.set_certificate(&identity.cert).unwrap();
    acceptor.check_private_key().unwrap();

    if options.require_client_cert {
        acceptor.cert_store_mut().add_cert(ca.cert.clone()).unwrap();
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }

    if let Some(protos) = options.alpn {
        acceptor.set_alpn_select_callback(move |_, client| {
            ssl::select_next_proto(protos, client).ok_or(AlpnError::NOACK)
        });
    }

    let acceptor = acceptor.build();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (tcp, _) = listener.accept().map_err(|e| e.to_string())?;
        tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut stream = acceptor.accept(tcp).map_err(|e| e.to_string())?;

        let client_subject = stream.ssl().peer_certificate().map(|cert| {
            hsm_tls::tls::CertInfo::from_x509(&cert).subject
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.ssl_read(&mut buf) {
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if stream.ssl_write(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = stream.shutdown();

        Ok(ServerReport {
            client_subject,
            received,
        })
    });

    (port, handle)
}

/// TcpSockets that counts calls
#[derive(Default)]
struct CountingSockets {
    inner: TcpSockets,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Sockets for CountingSockets {
    fn connect(
        &self,
        server: &ServerInfo,
        send_timeout: Duration,
        recv_timeout: Duration,
    ) -> Result<TcpStream, net::Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(server, send_timeout, recv_timeout)
    }

    fn disconnect(&self, stream: &TcpStream) -> Result<(), net::Error> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.disconnect(stream)
    }
}

fn mutual_auth_credentials(pki: &Pki) -> Credentials {
    Credentials::builder()
        .root_ca(&pki.root_path)
        .client_cert(&pki.client_cert_path)
        .key_id("slot-0")
        .build()
        .unwrap()
}

fn key_store(key: &EcIdentity) -> SoftKeyStore {
    let mut keys = SoftKeyStore::new();
    keys.insert("slot-0", key.key.clone());
    keys
}

fn send_all(conn: &mut Connection, mut data: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !data.is_empty() {
        assert!(Instant::now() < deadline, "send did not complete");
        let n = conn.send(data).unwrap();
        data = &data[n..];
    }
}

fn recv_exact(conn: &mut Connection, len: usize, chunk: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    while out.len() < len {
        assert!(Instant::now() < deadline, "receive did not complete");
        let n = conn.recv(&mut buf).unwrap();
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn test_mutual_auth_round_trip() {
    init_tracing();
    let pki = pki();
    let (port, server) = spawn_server(
        &pki.ca,
        &pki.server,
        ServerOptions {
            require_client_cert: true,
            alpn: Some(MQTT_ALPN),
        },
    );

    let credentials = Credentials::builder()
        .root_ca(&pki.root_path)
        .client_cert(&pki.client_cert_path)
        .key_id("slot-0")
        .sni_host_name("localhost")
        .alpn(&["x-amzn-mqtt-ca"])
        .unwrap()
        .max_fragment_length(4096)
        .build()
        .unwrap();

    let connector = Connector::new(key_store(&pki.client));
    let mut conn = connector
        .connect(&ServerInfo::new("localhost", port), &credentials)
        .unwrap();

    assert!(conn.is_connected());
    assert_eq!(conn.negotiated_alpn(), Some("x-amzn-mqtt-ca"));
    assert_eq!(conn.info().peer_subject(), Some("test-server"));
    assert_eq!(conn.info().servername.as_deref(), Some("localhost"));
    let applied = conn.info().applied;
    assert!(applied.alpn && applied.max_fragment_length && applied.sni);

    // Key handle was moved into the context and released
    assert_eq!(connector.key_provider().outstanding_handles(), 0);

    send_all(&mut conn, b"ping");
    assert_eq!(recv_exact(&mut conn, 4, 4), b"ping");

    // Single byte reads are served from the buffered record
    send_all(&mut conn, b"ab");
    assert_eq!(recv_exact(&mut conn, 2, 1), b"ab");

    assert_eq!(conn.disconnect(), Status::Success);
    assert!(!conn.is_connected());

    let report = server.join().unwrap().unwrap();
    assert_eq!(report.client_subject.as_deref(), Some("device-1"));
    assert_eq!(report.received, b"pingab");
}

#[test]
fn test_disconnect_twice_is_invalid_parameter() {
    init_tracing();
    let pki = pki();
    let (port, server) = spawn_server(&pki.ca, &pki.server, ServerOptions::default());

    let connector = Connector::new(key_store(&pki.client));
    let mut conn = connector
        .connect(&ServerInfo::new("127.0.0.1", port), &mutual_auth_credentials(&pki))
        .unwrap();

    assert_eq!(conn.disconnect(), Status::Success);
    assert_eq!(conn.disconnect(), Status::InvalidParameter);
    assert_eq!(conn.disconnect(), Status::InvalidParameter);

    let err = conn.send(b"late").unwrap_err();
    assert!(matches!(err, TlsError::NotConnected));
    assert_eq!(err.status(), Status::InvalidParameter);

    server.join().unwrap().unwrap();
}

#[test]
fn test_single_byte_recv_without_data_returns_zero() {
    init_tracing();
    let pki = pki();
    let (port, server) = spawn_server(&pki.ca, &pki.server, ServerOptions::default());

    // A short receive timeout bounds the read if a session ticket makes the
    // socket look readable.
    let connector = Connector::new(key_store(&pki.client))
        .config(TransportConfig::new().recv_timeout(Duration::from_millis(200)));
    let mut conn = connector
        .connect(&ServerInfo::new("localhost", port), &mutual_auth_credentials(&pki))
        .unwrap();

    let mut byte = [0u8; 1];
    for _ in 0..3 {
        assert_eq!(conn.recv(&mut byte).unwrap(), 0);
    }

    let mut empty: [u8; 0] = [];
    assert!(matches!(conn.recv(&mut empty), Err(TlsError::InvalidParameter(_))));

    assert_eq!(conn.disconnect(), Status::Success);
    server.join().unwrap().unwrap();
}

#[test]
fn test_server_auth_only_without_options() {
    init_tracing();
    let pki = pki();
    let (port, server) = spawn_server(&pki.ca, &pki.server, ServerOptions::default());

    let credentials = Credentials::builder().root_ca(&pki.root_path).build().unwrap();
    let connector = Connector::new(SoftKeyStore::new());
    let mut conn = connector
        .connect(&ServerInfo::new("localhost", port), &credentials)
        .unwrap();

    assert!(conn.info().applied.is_empty());
    assert_eq!(conn.negotiated_alpn(), None);
    assert_eq!(conn.info().servername, None);

    assert_eq!(conn.disconnect(), Status::Success);
    let report = server.join().unwrap().unwrap();
    assert_eq!(report.client_subject, None);
}

#[test]
fn test_key_mismatch_never_touches_the_network() {
    init_tracing();
    let pki = pki();

    // The slot holds a key that does not belong to the client certificate
    let keys = key_store(&pki.server);
    let sockets = Arc::new(CountingSockets::default());
    let connector = Connector::new(keys).sockets(sockets.clone());

    let err = connector
        .connect(&ServerInfo::new("localhost", 1), &mutual_auth_credentials(&pki))
        .unwrap_err();

    assert!(matches!(err, TlsError::KeyMismatch(_)));
    assert_eq!(err.status(), Status::InvalidCredentials);
    assert_eq!(sockets.connects.load(Ordering::SeqCst), 0);
    assert_eq!(connector.key_provider().outstanding_handles(), 0);
}

#[test]
fn test_hostname_mismatch_fails_handshake() {
    init_tracing();
    let pki = pki();
    let wrong_name = test_pki::leaf(&pki.ca, "elsewhere", &["elsewhere.example.com"]);
    let (port, server) = spawn_server(&pki.ca, &wrong_name, ServerOptions::default());

    let sockets = Arc::new(CountingSockets::default());
    let connector = Connector::new(key_store(&pki.client)).sockets(sockets.clone());

    let err = connector
        .connect(&ServerInfo::new("localhost", port), &mutual_auth_credentials(&pki))
        .unwrap_err();

    assert_eq!(err.status(), Status::HandshakeFailed);
    assert_eq!(sockets.connects.load(Ordering::SeqCst), 1);
    assert_eq!(sockets.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(connector.key_provider().outstanding_handles(), 0);

    assert!(server.join().unwrap().is_err());
}

#[test]
fn test_untrusted_server_fails_handshake() {
    init_tracing();
    let pki = pki();
    let rogue_ca = test_pki::root_ca("Rogue Root");
    let rogue = test_pki::leaf(&rogue_ca, "test-server", &["localhost"]);
    let (port, server) = spawn_server(&rogue_ca, &rogue, ServerOptions::default());

    let connector = Connector::new(key_store(&pki.client));
    let err = connector
        .connect(&ServerInfo::new("localhost", port), &mutual_auth_credentials(&pki))
        .unwrap_err();

    assert!(matches!(err, TlsError::Verification(_)));
    assert_eq!(err.status(), Status::HandshakeFailed);

    assert!(server.join().unwrap().is_err());
}

#[test]
fn test_connection_refused() {
    init_tracing();
    let pki = pki();

    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let connector = Connector::new(key_store(&pki.client));
    let err = connector
        .connect(&ServerInfo::new("127.0.0.1", port), &mutual_auth_credentials(&pki))
        .unwrap_err();

    assert_eq!(err.status(), Status::ConnectFailure);
    assert_eq!(connector.key_provider().outstanding_handles(), 0);
}

#[test]
fn test_missing_client_certificate_file() {
    init_tracing();
    let pki = pki();
    let credentials = Credentials::builder()
        .root_ca(&pki.root_path)
        .client_cert(pki.root_path.with_file_name("absent.pem"))
        .key_id("slot-0")
        .build()
        .unwrap();

    let sockets = Arc::new(CountingSockets::default());
    let connector = Connector::new(key_store(&pki.client)).sockets(sockets.clone());
    let err = connector
        .connect(&ServerInfo::new("localhost", 1), &credentials)
        .unwrap_err();

    assert_eq!(err.status(), Status::InvalidCredentials);
    assert_eq!(sockets.connects.load(Ordering::SeqCst), 0);
    assert_eq!(connector.key_provider().outstanding_handles(), 0);
}
