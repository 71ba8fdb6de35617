//! wsgate client
//!
//! Dials out to the gateway, keeps one session alive and reconnects when it
//! drops. Local transfers accept TCP connections and proxy them across the
//! session; streams opened by the gateway are proxied to local targets.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use url::Url;
use wsgate::client::{self, ClientConfig};
use wsgate::config;
use wsgate::tunnel::{listener, SessionManager};

/// wsgate client - TCP tunnel over a WebSocket carrier
#[derive(Parser, Debug)]
#[command(name = "wsgate-client")]
#[command(about = "wsgate client - mutually-authenticated TCP tunnel over WebSocket")]
#[command(version)]
struct Args {
    /// Bind address (legacy single-listener flag, accepted but unused)
    #[arg(long, default_value = "127.0.0.1:1080")]
    #[allow(dead_code)]
    bind: String,

    /// WebSocket gateway URL
    #[arg(long = "gw", default_value = "ws://localhost:1081")]
    gateway: String,

    /// Proxy to reach the gateway
    #[arg(long)]
    proxy: Option<String>,

    /// Server name for the safe tunnel
    #[arg(long, default_value = "localhost")]
    safe_server_name: String,

    /// Key for TLS auth
    #[arg(long, default_value = "client.key")]
    key: PathBuf,

    /// Certificate for TLS auth
    #[arg(long, default_value = "client.crt")]
    crt: PathBuf,

    /// CA certificate for TLS auth
    #[arg(long, default_value = "ca.crt")]
    ca: PathBuf,

    /// Local port transfers (syntax: <local addr>:<local port>:<remote addr>:<remote port>)
    #[arg(short = 'L', long = "local-transfer")]
    local_transfers: Vec<String>,

    /// Credentials bundle; overrides --gw, --safe-server-name and the PEM flags
    bundle: Option<PathBuf>,

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

    info!("wsgate client v{}", wsgate::VERSION);

    let (gateway_url, safe_server_name, credentials) = match &args.bundle {
        Some(path) => {
            let bundle =
                config::load_bundle(path).context("failed to load credentials bundle")?;
            (bundle.url, bundle.server_name, bundle.credentials)
        }
        None => {
            let credentials = config::load_credentials(&args.crt, &args.key, &args.ca)
                .context("failed to load TLS auth files")?;
            (args.gateway.clone(), args.safe_server_name.clone(), credentials)
        }
    };

    let gateway = Url::parse(&gateway_url)
        .with_context(|| format!("invalid gateway URL {gateway_url:?}"))?;
    let proxy = args
        .proxy
        .as_deref()
        .map(Url::parse)
        .transpose()
        .context("invalid proxy URL")?;

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

    let config = ClientConfig {
        gateway,
        proxy,
        safe_server_name,
        credentials,
        retry_delay: client::DEFAULT_RETRY_DELAY,
    };

    tokio::select! {
        result = client::run(config, manager) => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
