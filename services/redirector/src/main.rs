//! plfm-vt Redirector
//!
//! Forwards TCP traffic from tunnel ports to their backends:
//! - Runs several SO_REUSEPORT workers per listening port
//! - Relays bytes in both directions with idle timeouts
//! - Probes backend and tunnel health on an interval
//! - Pushes connection and health telemetry to the API
//! - Serves local `/health`, `/config` and `/status` endpoints

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_redirector::{supervisor, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to REDIRECTOR_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt redirector");
    info!(
        ports = ?config.ports(),
        workers_per_port = config.workers_per_port,
        listen_host = %config.listen_host,
        tunnel = %config.tunnel.target(),
        api_url = %config.api_url,
        status_addr = %config.status_addr,
        "Configuration loaded"
    );

    supervisor::run(config).await
}
