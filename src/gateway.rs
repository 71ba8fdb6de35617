//! The gateway side: accept WebSocket upgrades, authenticate with the safe
//! tunnel, and serve the resulting session.
//!
//! The safe-TLS handshake with a required, CA-verified client certificate
//! is the sole authentication check; a peer that fails it never reaches the
//! mux. The gateway holds a single active session — a newly authenticated
//! connection displaces the previous session.

use crate::config::Credentials;
use crate::mux::MuxSession;
use crate::transport::{tls, ws};
use crate::tunnel::SessionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub struct GatewayConfig {
    /// HTTP listen spec, `addr:port`.
    pub http_bind: String,
    /// Gateway identity and CA trust for the safe tunnel.
    pub credentials: Credentials,
}

/// A gateway bound to its HTTP listen address.
pub struct Gateway {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl Gateway {
    /// Bind the HTTP listener and prepare the safe-TLS acceptor. Failures
    /// here are fatal at startup.
    pub async fn bind(config: GatewayConfig) -> crate::Result<Self> {
        let acceptor = tls::safe_acceptor(&config.credentials)?;
        let listener = TcpListener::bind(&config.http_bind).await?;
        info!(bind = %config.http_bind, "listening");
        Ok(Gateway { listener, acceptor })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever. Per-connection failures are logged and
    /// do not disturb the active session.
    pub async fn run(self, manager: Arc<SessionManager>) -> crate::Result<()> {
        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!(%peer, "connection accepted");

            let acceptor = self.acceptor.clone();
            let manager = manager.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(conn, acceptor, manager).await {
                    warn!(%peer, error = %e, "connection failed");
                }
            });
        }
    }
}

async fn handle_connection(
    conn: TcpStream,
    acceptor: TlsAcceptor,
    manager: Arc<SessionManager>,
) -> crate::Result<()> {
    let _ = conn.set_nodelay(true);

    let websocket = ws::accept(conn).await?;

    // Unauthenticated peers terminate here, before any session state moves.
    let safe = acceptor.accept(websocket).await?;
    debug!("safe tunnel established");

    let session = MuxSession::server(safe);
    manager.install(session.clone());
    manager.serve(session).await;
    Ok(())
}
