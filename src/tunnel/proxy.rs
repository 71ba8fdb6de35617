//! Proxying an accepted inbound stream to its target.
//!
//! The first bytes of every stream are an ASCII `host:port` line. Whatever
//! the buffered reader prefetched past the newline is the start of the
//! application data, so the same reader feeds the splice.

use super::splice::splice_split;
use crate::mux::MuxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Timeout for dialing the target.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Hook consulted with the target address before dialing.
///
/// An extension point: the tunnel itself imposes no policy.
pub trait TargetGate: Send + Sync + 'static {
    fn allow(&self, target: &str) -> bool;
}

/// The default gate: every target is allowed.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl TargetGate for AllowAll {
    fn allow(&self, _target: &str) -> bool {
        true
    }
}

/// Serve one inbound stream: read the target line, dial it, splice.
/// Failures close the stream and are local to it.
pub async fn serve_stream(stream: MuxStream, gate: Arc<dyn TargetGate>) {
    let id = stream.id();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => {
            warn!(stream = id, "stream closed before target address");
            return;
        }
        Ok(_) if !line.ends_with('\n') => {
            warn!(stream = id, "stream ended inside target address");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(stream = id, error = %e, "failed to read target address");
            return;
        }
    }
    let target = line.trim_end_matches('\n');

    if !gate.allow(target) {
        warn!(stream = id, %target, "target refused");
        return;
    }

    debug!(stream = id, %target, "proxying");
    let conn = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            warn!(stream = id, %target, error = %e, "target dial failed");
            return;
        }
        Err(_) => {
            warn!(stream = id, %target, "target dial timed out");
            return;
        }
    };
    let _ = conn.set_nodelay(true);

    let (conn_read, conn_write) = conn.into_split();
    splice_split(reader, write_half, conn_read, conn_write).await;
    debug!(stream = id, %target, "proxying finished");
}
