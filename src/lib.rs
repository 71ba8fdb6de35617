//! # wsgate
//!
//! A bidirectional TCP tunnel that crosses HTTP reverse-proxy boundaries.
//!
//! A long-lived client inside a private network dials outbound to a public
//! gateway. The connection is layered:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  TCP stream proxying                 │
//! │        (local listeners ⇄ remote target dials)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Stream multiplexer                  │
//! │       (yamux framing, many streams, both ways)       │
//! ├─────────────────────────────────────────────────────┤
//! │                    Safe tunnel                       │
//! │         (TLS with mutual certificate auth)           │
//! ├─────────────────────────────────────────────────────┤
//! │                     Carrier                          │
//! │   (WebSocket over TCP, optional outer TLS / proxy)   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The WebSocket carrier exists to traverse HTTP middleboxes; the inner TLS
//! layer is the trust anchor. Either side can open streams: each stream
//! starts with a `host:port\n` line naming the target, and the peer that
//! accepts the stream dials that target locally and proxies bytes both ways.

pub mod client;
pub mod config;
pub mod gateway;
pub mod mux;
pub mod transport;
pub mod tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
