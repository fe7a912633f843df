use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use meshboard::canvas::MemCanvas;
use meshboard::config::Config;
use meshboard::node;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (MESHBOARD_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("MESHBOARD_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("meshboard=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = Config::parse();
    tracing::info!("Starting meshboard node on port {}", config.port);
    if let Some(ref addr) = config.connect {
        tracing::info!("Joining board at {addr}");
    }

    let node = node::start(config, Arc::new(MemCanvas::default())).await?;
    tracing::info!(id = %node.client_id(), "Node ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    node.shutdown();
    Ok(())
}
