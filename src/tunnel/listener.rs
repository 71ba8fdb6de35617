//! Local TCP listeners.
//!
//! Every configured local transfer binds once at startup and outlives
//! session replacements. Accepted connections snapshot the current session:
//! with no session they are dropped immediately, otherwise a stream is
//! opened, the target line written, and the two ends spliced.

use super::manager::SessionManager;
use super::splice::splice;
use super::TunnelError;
use crate::config::ListenerSpec;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// A bound local listener, not yet accepting.
pub struct BoundListener {
    spec: ListenerSpec,
    listener: TcpListener,
}

impl BoundListener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn target(&self) -> &str {
        &self.spec.target
    }
}

/// Bind every listener. Any bind failure is fatal at startup.
pub async fn bind(specs: Vec<ListenerSpec>) -> Result<Vec<BoundListener>, TunnelError> {
    let mut bound = Vec::with_capacity(specs.len());
    for spec in specs {
        let addr = bind_addr(&spec.listen);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;
        info!(listen = %spec.listen, target = %spec.target, "listening");
        bound.push(BoundListener { spec, listener });
    }
    Ok(bound)
}

/// Spawn one accept task per listener.
pub fn spawn_all(listeners: Vec<BoundListener>, manager: Arc<SessionManager>) {
    for listener in listeners {
        tokio::spawn(run_listener(listener, manager.clone()));
    }
}

async fn run_listener(bound: BoundListener, manager: Arc<SessionManager>) {
    loop {
        match bound.listener.accept().await {
            Ok((conn, peer)) => {
                debug!(%peer, target = %bound.spec.target, "local connection");
                let target = bound.spec.target.clone();
                let manager = manager.clone();
                tokio::spawn(handle_conn(conn, target, manager));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Tunnel one accepted local connection to `target` across the current
/// session. Without a session the connection is closed immediately.
async fn handle_conn(conn: TcpStream, target: String, manager: Arc<SessionManager>) {
    let Some(session) = manager.current() else {
        debug!(%target, "no active session, dropping connection");
        return;
    };

    let mut stream = match session.open().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%target, error = %e, "failed to open stream");
            return;
        }
    };

    if let Err(e) = stream.write_all(format!("{target}\n").as_bytes()).await {
        warn!(%target, error = %e, "failed to send target address");
        return;
    }

    let _ = conn.set_nodelay(true);
    debug!(%target, "tunneling");
    splice(conn, stream).await;
    debug!(%target, "tunneling finished");
}

/// A `:port` spec binds all interfaces.
fn bind_addr(listen: &str) -> String {
    if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen.to_string()
    }
}
