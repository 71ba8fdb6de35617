//! wsgate gateway
//!
//! Public side of the tunnel: an HTTP endpoint that upgrades to WebSocket,
//! authenticates the client inside the safe tunnel, and serves the single
//! active session. Local transfers here tunnel gateway-side TCP connections
//! back into the client's network.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wsgate::config;
use wsgate::gateway::{Gateway, GatewayConfig};
use wsgate::tunnel::{listener, SessionManager};

/// wsgate gateway - TCP tunnel over a WebSocket carrier
#[derive(Parser, Debug)]
#[command(name = "wsgate-gateway")]
#[command(about = "wsgate gateway - mutually-authenticated TCP tunnel over WebSocket")]
#[command(version)]
struct Args {
    /// HTTP listen spec
    #[arg(long, default_value = "127.0.0.1:1081")]
    http: String,

    /// Certificate file
    #[arg(long, default_value = "server.crt")]
    crt: PathBuf,

    /// Key file
    #[arg(long, default_value = "server.key")]
    key: PathBuf,

    /// CA certificate file
    #[arg(long, default_value = "ca.crt")]
    ca: PathBuf,

    /// Local port transfers (syntax: <local addr>:<local port>:<remote addr>:<remote port>)
    #[arg(short = 'L', long = "local-transfer")]
    local_transfers: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    info!("wsgate gateway v{}", wsgate::VERSION);

    let credentials = config::load_credentials(&args.crt, &args.key, &args.ca)
        .context("failed to load TLS files")?;

    let specs = config::collect_listeners(
        &args.local_transfers,
        std::env::var("CONFIG").ok().as_deref(),
    )
    .context("invalid listener configuration")?;

    let manager = Arc::new(SessionManager::new());

    let listeners = listener::bind(specs)
        .await
        .context("failed to start local listeners")?;
    listener::spawn_all(listeners, manager.clone());

    let gateway = Gateway::bind(GatewayConfig {
        http_bind: args.http,
        credentials,
    })
    .await
    .context("failed to start gateway")?;

    tokio::select! {
        result = gateway.run(manager) => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
