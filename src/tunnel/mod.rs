//! The tunnel engine: bidirectional splicing, local listeners, the inbound
//! stream proxy, and the single-slot session manager.

pub mod listener;
pub mod manager;
pub mod proxy;
pub mod splice;

pub use manager::SessionManager;
pub use proxy::{AllowAll, TargetGate};
pub use splice::{splice, Duplex};

/// Tunnel layer errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}
