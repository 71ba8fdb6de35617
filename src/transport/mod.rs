//! Carrier transports: TCP dialing (optionally through an outbound proxy),
//! the WebSocket carrier, and both TLS layers.

pub mod outbound;
pub mod tls;
pub mod ws;

use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("connect timed out")]
    Timeout,
}

/// Anything that can carry the next layer of the stack.
pub trait Carrier: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Carrier for T {}

/// A type-erased carrier, so the dialer can stack optional layers.
pub type BoxedCarrier = Box<dyn Carrier>;
