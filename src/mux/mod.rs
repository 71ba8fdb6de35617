//! Stream multiplexer over one reliable byte stream.
//!
//! Wire format is yamux: 12-byte headers (version, type, flags, stream id,
//! length), data frames, window updates, pings and go-away, with odd stream
//! ids on the connection initiator and even ids on the acceptor. One
//! [`MuxSession`] carries many [`MuxStream`]s; both sides can open and accept
//! concurrently, each direction of a stream half-closes independently, and
//! closing the session aborts every outstanding stream.

mod frame;
mod session;
mod stream;

pub use session::MuxSession;
pub use stream::{MuxReadHalf, MuxStream, MuxWriteHalf};

use std::time::Duration;

/// Mux layer errors
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("session closed")]
    SessionClosed,

    #[error("ping timed out")]
    PingTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("too many streams")]
    TooManyStreams,

    #[error("stream ids exhausted")]
    StreamsExhausted,

    #[error("remote went away (code {0})")]
    GoAway(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initial flow-control window per stream and direction (yamux default).
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Maximum number of concurrent streams per session.
pub const MAX_STREAMS: usize = 1024;

/// Largest data frame we emit. Received frames are bounded by the window.
pub(crate) const MAX_DATA_FRAME: usize = 64 * 1024;

/// Inbound streams queued before the session pushes back on the peer.
pub(crate) const ACCEPT_BACKLOG: usize = 256;

/// How long a ping may stay unanswered.
pub(crate) const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between keepalive pings; a keepalive still unanswered when the
/// next one is due ends the session.
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Build a connected client/server session pair over an in-memory pipe.
#[cfg(test)]
pub(crate) fn session_pair() -> (MuxSession, MuxSession) {
    let (client_io, server_io) = tokio::io::duplex(INITIAL_WINDOW as usize);
    (MuxSession::client(client_io), MuxSession::server(server_io))
}
