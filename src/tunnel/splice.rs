//! Bidirectional copy between two duplex streams with half-close.
//!
//! Half-close propagation is what lets protocols that signal "no more
//! requests" by closing one direction (HTTP/1.x, line-oriented protocols,
//! SSH) terminate cleanly through the tunnel: EOF on one side shuts down
//! only the peer's write side, and the opposite direction keeps flowing
//! until it reaches its own EOF. Closing both sides on the first EOF would
//! truncate the reply.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::mux::{MuxReadHalf, MuxStream, MuxWriteHalf};

/// A byte stream that splits into independently closable halves.
///
/// This is the half-close capability seam: shutting down the write half is
/// the stream's closest approximation of "close write" — a TCP shutdown, a
/// mux FIN — while the read half stays usable.
pub trait Duplex {
    type ReadHalf: AsyncRead + Unpin + Send + 'static;
    type WriteHalf: AsyncWrite + Unpin + Send + 'static;

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf);
}

impl Duplex for TcpStream {
    type ReadHalf = tokio::net::tcp::OwnedReadHalf;
    type WriteHalf = tokio::net::tcp::OwnedWriteHalf;

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf) {
        TcpStream::into_split(self)
    }
}

impl Duplex for MuxStream {
    type ReadHalf = MuxReadHalf;
    type WriteHalf = MuxWriteHalf;

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf) {
        MuxStream::into_split(self)
    }
}

/// Copy bytes both ways between `a` and `b` until each direction has
/// finished. Best-effort: errors end the affected direction and close its
/// destination, the other direction drains.
pub async fn splice<A: Duplex, B: Duplex>(a: A, b: B) {
    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();
    splice_split(a_read, a_write, b_read, b_write).await;
}

/// [`splice`] over already-split halves, for callers that wrapped a read
/// half in a buffered reader and must not lose its prefetched bytes.
pub async fn splice_split<AR, AW, BR, BW>(a_read: AR, a_write: AW, b_read: BR, b_write: BW)
where
    AR: AsyncRead + Unpin + Send + 'static,
    AW: AsyncWrite + Unpin + Send + 'static,
    BR: AsyncRead + Unpin + Send + 'static,
    BW: AsyncWrite + Unpin + Send + 'static,
{
    let forward = tokio::spawn(copy_then_close(a_read, b_write));
    let backward = tokio::spawn(copy_then_close(b_read, a_write));

    // Both directions must finish before the endpoints are released.
    let _ = forward.await;
    let _ = backward.await;
}

/// Copy until EOF or error, then close the destination's write side.
async fn copy_then_close<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => trace!(bytes, "copy finished"),
        Err(e) => trace!(error = %e, "copy ended"),
    }
    let _ = writer.shutdown().await;
}
