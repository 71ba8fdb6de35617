//! The client side: a four-stage connect and a reconnect loop.
//!
//! Stage 0 dials TCP to the gateway host, through the outbound proxy when
//! one is configured, wrapping in outer TLS for `wss` URLs. Stage 1 runs
//! the WebSocket handshake. Stage 2 runs the safe-tunnel TLS handshake,
//! presenting the client certificate and verifying the gateway against the
//! private CA under the configured server name. Stage 3 starts the mux.
//!
//! Every stage failure is retried after a delay; nothing past startup is
//! fatal.

use crate::config::Credentials;
use crate::mux::MuxSession;
use crate::transport::{outbound, tls, ws, BoxedCarrier, TransportError};
use crate::tunnel::SessionManager;
use rand::Rng;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};
use url::Url;

/// Delay between reconnect attempts, before jitter.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct ClientConfig {
    /// Carrier URL, scheme `ws` or `wss`. The path is ignored by the
    /// gateway.
    pub gateway: Url,
    /// Optional outbound proxy for reaching the gateway.
    pub proxy: Option<Url>,
    /// SNI and verification name for the safe tunnel.
    pub safe_server_name: String,
    /// Client identity and CA trust for the safe tunnel.
    pub credentials: Credentials,
    /// Base reconnect delay; ±20 % jitter is applied.
    pub retry_delay: Duration,
}

/// Run the client: connect, serve the session, reconnect forever.
/// Only invalid configuration makes this return.
pub async fn run(config: ClientConfig, manager: Arc<SessionManager>) -> crate::Result<()> {
    match config.gateway.scheme() {
        "ws" | "wss" => {}
        scheme => {
            return Err(TransportError::InvalidUrl(format!(
                "gateway URL scheme must be ws or wss, got {scheme:?}"
            ))
            .into())
        }
    }
    let connector = tls::safe_connector(&config.credentials)?;
    let server_name = tls::server_name(&config.safe_server_name)?;

    loop {
        match connect(&config, &connector, &server_name).await {
            Ok(session) => {
                manager.install(session.clone());
                manager.serve(session).await;
            }
            Err(e) => warn!(error = %e, "connect failed"),
        }

        let delay = with_jitter(config.retry_delay);
        info!("retrying in {:.1}s", delay.as_secs_f32());
        tokio::time::sleep(delay).await;
    }
}

/// One connection attempt through all four stages.
async fn connect(
    config: &ClientConfig,
    connector: &TlsConnector,
    server_name: &ServerName<'static>,
) -> crate::Result<MuxSession> {
    let host = config
        .gateway
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("gateway URL has no host".to_string()))?;
    let port = config
        .gateway
        .port_or_known_default()
        .ok_or_else(|| TransportError::InvalidUrl("gateway URL has no port".to_string()))?;

    info!(gateway = %config.gateway, "connection, stage 0");
    let tcp = outbound::dial(config.proxy.as_ref(), host, port).await?;
    let carrier: BoxedCarrier = if config.gateway.scheme() == "wss" {
        // Outer TLS satisfies TLS-terminating middleboxes only; the safe
        // tunnel below is the trust anchor, so no verification here.
        let outer = tls::outer_connector();
        let name = tls::server_name(host)?;
        Box::new(
            outer
                .connect(name, tcp)
                .await
                .map_err(TransportError::Io)?,
        )
    } else {
        Box::new(tcp)
    };

    info!("connection, stage 1");
    let websocket = ws::connect(carrier, &config.gateway).await?;

    info!("connection, stage 2");
    let safe = connector
        .connect(server_name.clone(), websocket)
        .await
        .map_err(TransportError::Io)?;

    info!("connection, stage 3");
    Ok(MuxSession::client(safe))
}

/// ±20 % jitter so restarted gateways are not stampeded.
fn with_jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(5);
        for _ in 0..100 {
            let delay = with_jitter(base);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(6));
        }
    }
}
