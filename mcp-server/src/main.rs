//! `maas-mcp-server` entry point.
//!
//! Reads JSON-RPC from stdin and writes to stdout, so all logging goes to
//! stderr.

use std::path::PathBuf;

use clap::Parser;
use maas_async_utils::AbortSignal;
use maas_mcp_server::config::ConfigLoader;
use maas_mcp_server::server::McpServer;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "maas-mcp-server", version, about = "MCP server for MAAS machine operations")]
struct Cli {
    /// Configuration file (TOML). Defaults to ./maas-mcp.toml or the user
    /// config directory.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `maas_operations=debug`. Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path).load()?,
        None => ConfigLoader::load_default()?,
    };
    tracing::info!(
        backend = %config.backend.url,
        "maas-mcp-server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let server = McpServer::from_config(&config)?;

    let shutdown = AbortSignal::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Signal received, shutting down");
                shutdown.abort("interrupted");
            }
        }
    });

    server
        .serve(tokio::io::stdin(), tokio::io::stdout(), shutdown)
        .await?;

    tracing::info!("maas-mcp-server exiting cleanly");
    Ok(())
}
