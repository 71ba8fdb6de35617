//! End-to-end tests for the full tunnel stack: TCP, WebSocket carrier, safe
//! TLS with mutual authentication, mux, and stream proxying in both
//! directions. Certificates are minted with a throwaway CA per test.

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;
use wsgate::client::{self, ClientConfig};
use wsgate::config::{Credentials, ListenerSpec};
use wsgate::gateway::{Gateway, GatewayConfig};
use wsgate::mux::MuxSession;
use wsgate::tunnel::{listener, SessionManager};

/// The safe-tunnel server name used throughout the tests.
const SAFE_NAME: &str = "wsgate-safe";

struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

fn new_ca() -> TestCa {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let cert = params.self_signed(&key).unwrap();
    TestCa { cert, key }
}

/// Issue a leaf certificate for `name`, signed by `ca`.
fn issue(ca: &TestCa, name: &str) -> Credentials {
    let key = KeyPair::generate().unwrap();
    let params = CertificateParams::new(vec![name.to_string()]).unwrap();
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();

    Credentials {
        certs: vec![cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        ca: vec![ca.cert.der().clone()],
    }
}

async fn start_gateway(credentials: Credentials) -> (SocketAddr, Arc<SessionManager>) {
    let manager = Arc::new(SessionManager::new());
    let gateway = Gateway::bind(GatewayConfig {
        http_bind: "127.0.0.1:0".to_string(),
        credentials,
    })
    .await
    .unwrap();
    let addr = gateway.local_addr().unwrap();

    let serve_manager = manager.clone();
    tokio::spawn(async move {
        let _ = gateway.run(serve_manager).await;
    });
    (addr, manager)
}

async fn start_client(gateway: SocketAddr, credentials: Credentials) -> Arc<SessionManager> {
    let manager = Arc::new(SessionManager::new());
    let config = ClientConfig {
        gateway: Url::parse(&format!("ws://127.0.0.1:{}/", gateway.port())).unwrap(),
        proxy: None,
        safe_server_name: SAFE_NAME.to_string(),
        credentials,
        retry_delay: Duration::from_millis(200),
    };
    let run_manager = manager.clone();
    tokio::spawn(async move {
        let _ = client::run(config, run_manager).await;
    });
    manager
}

async fn wait_for_session(manager: &SessionManager) -> MuxSession {
    for _ in 0..500 {
        if let Some(session) = manager.current() {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no session established within 5s");
}

/// Echo server: copies bytes back until EOF, then half-closes.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = conn.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });
    addr
}

/// Bind one local listener serving `target` through `manager`.
async fn start_transfer(manager: Arc<SessionManager>, target: SocketAddr) -> SocketAddr {
    let bound = listener::bind(vec![ListenerSpec {
        listen: "127.0.0.1:0".to_string(),
        target: target.to_string(),
    }])
    .await
    .unwrap();
    let addr = bound[0].local_addr().unwrap();
    listener::spawn_all(bound, manager);
    addr
}

#[tokio::test]
async fn echo_through_tunnel() {
    let ca = new_ca();
    let (gateway_addr, gateway_manager) = start_gateway(issue(&ca, SAFE_NAME)).await;
    let client_manager = start_client(gateway_addr, issue(&ca, "tunnel-client")).await;

    wait_for_session(&client_manager).await;
    wait_for_session(&gateway_manager).await;

    // Echo service on the gateway side, local transfer on the client side.
    let echo = spawn_echo().await;
    let local = start_transfer(client_manager.clone(), echo).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"hello\n").await.unwrap();
    conn.shutdown().await.unwrap();

    // Half-close fidelity: the reply arrives in full, then EOF.
    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"hello\n");
}

#[tokio::test]
async fn reverse_tunnel() {
    let ca = new_ca();
    let (gateway_addr, gateway_manager) = start_gateway(issue(&ca, SAFE_NAME)).await;
    let client_manager = start_client(gateway_addr, issue(&ca, "tunnel-client")).await;

    wait_for_session(&client_manager).await;
    wait_for_session(&gateway_manager).await;

    // Echo service on the client side, local transfer on the gateway side.
    let echo = spawn_echo().await;
    let local = start_transfer(gateway_manager.clone(), echo).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    conn.shutdown().await.unwrap();

    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"ping");
}

#[tokio::test]
async fn no_session_drops_connections() {
    // Listener present, no gateway reachable: accepted connections close
    // immediately with zero bytes.
    let manager = Arc::new(SessionManager::new());
    let echo = spawn_echo().await;
    let local = start_transfer(manager, echo).await;

    let mut conn = TcpStream::connect(local).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), conn.read_to_end(&mut buf))
        .await
        .expect("connection should close promptly")
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn new_client_replaces_the_session() {
    let ca = new_ca();
    let (gateway_addr, gateway_manager) = start_gateway(issue(&ca, SAFE_NAME)).await;

    let first_manager = start_client(gateway_addr, issue(&ca, "client-a")).await;
    let first_client_session = wait_for_session(&first_manager).await;
    let first_gateway_session = wait_for_session(&gateway_manager).await;

    // A second client with valid credentials displaces the first session.
    let _second_manager = start_client(gateway_addr, issue(&ca, "client-b")).await;

    for _ in 0..500 {
        if let Some(current) = gateway_manager.current() {
            if !current.same_session(&first_gateway_session) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let current = wait_for_session(&gateway_manager).await;
    assert!(!current.same_session(&first_gateway_session));

    // The displaced session is dead on both ends.
    assert!(first_gateway_session.open().await.is_err());
    for _ in 0..500 {
        if first_client_session.ping().await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(first_client_session.ping().await.is_err());

    // The first client's reconnect loop installs a fresh session in turn
    // (displacing the second client: the documented single-slot oscillation).
    for _ in 0..500 {
        match first_manager.current() {
            Some(session) if !session.same_session(&first_client_session) => return,
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("first client did not reconnect");
}

#[tokio::test]
async fn unauthenticated_client_is_rejected() {
    let ca = new_ca();
    let rogue_ca = new_ca();
    let (gateway_addr, gateway_manager) = start_gateway(issue(&ca, SAFE_NAME)).await;

    // Certificate from the wrong CA: WebSocket upgrade succeeds, the safe
    // TLS handshake does not, and no session is ever installed.
    let _rogue_manager = start_client(gateway_addr, issue(&rogue_ca, "rogue")).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(gateway_manager.current().is_none());

    // The gateway still accepts a legitimate client afterwards.
    let good_manager = start_client(gateway_addr, issue(&ca, "tunnel-client")).await;
    wait_for_session(&good_manager).await;
    wait_for_session(&gateway_manager).await;
}

#[tokio::test]
async fn target_dial_failure_leaves_the_session_alive() {
    let ca = new_ca();
    let (gateway_addr, gateway_manager) = start_gateway(issue(&ca, SAFE_NAME)).await;
    let client_manager = start_client(gateway_addr, issue(&ca, "tunnel-client")).await;

    wait_for_session(&client_manager).await;
    let gateway_session = wait_for_session(&gateway_manager).await;

    // Port 1 is closed: the stream and its TCP side die, nothing else.
    let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let broken = start_transfer(client_manager.clone(), unreachable).await;

    let mut conn = TcpStream::connect(broken).await.unwrap();
    conn.write_all(b"doomed").await.unwrap();
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());

    // The session survived and still proxies.
    let echo = spawn_echo().await;
    let local = start_transfer(client_manager.clone(), echo).await;
    let mut conn = TcpStream::connect(local).await.unwrap();
    conn.write_all(b"alive").await.unwrap();
    conn.shutdown().await.unwrap();
    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"alive");

    let current = wait_for_session(&gateway_manager).await;
    assert!(current.same_session(&gateway_session));
}

#[tokio::test]
async fn concurrent_streams_through_the_tunnel() {
    let ca = new_ca();
    let (gateway_addr, gateway_manager) = start_gateway(issue(&ca, SAFE_NAME)).await;
    let client_manager = start_client(gateway_addr, issue(&ca, "tunnel-client")).await;

    wait_for_session(&client_manager).await;
    wait_for_session(&gateway_manager).await;

    let echo = spawn_echo().await;
    let local = start_transfer(client_manager.clone(), echo).await;

    let mut tasks = Vec::new();
    for i in 0u8..10 {
        tasks.push(tokio::spawn(async move {
            let mut conn = TcpStream::connect(local).await.unwrap();
            let message = vec![i; 4096];
            conn.write_all(&message).await.unwrap();
            conn.shutdown().await.unwrap();
            let mut reply = Vec::new();
            conn.read_to_end(&mut reply).await.unwrap();
            assert_eq!(reply, message);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
