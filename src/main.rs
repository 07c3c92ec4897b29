use std::path::PathBuf;

use anyhow::Context;
use chaincache::{PositionService, ServiceConfig, http};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chaincache", about = "Cached read endpoint for EVM position and token data")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "chaincache.toml")]
    config: PathBuf,

    /// Listen address, overriding the configured one
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chaincache=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ServiceConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let service = PositionService::new(&config);
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, http::router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    Ok(())
}
