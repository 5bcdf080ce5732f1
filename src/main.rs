use anyhow::Result;
use clap::Parser;
use rmcp::{transport::io, ServiceExt};
use std::path::PathBuf;
use std::process::exit;
use toolhost::config::ServerConfig;
use toolhost::server::ToolHost;

#[derive(Parser, Debug)]
#[command(
    name = "toolhost",
    version,
    about = "Dynamic MCP tool server running user plugins in isolated Python environments"
)]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "toolhost.toml")]
    config: PathBuf,

    /// Override the plugin root directory
    #[arg(long)]
    plugin_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries JSON-RPC; logs go to stderr without ANSI codes.
    toolhost::logging::init_logging(false);

    let cli = Cli::parse();
    let mut config = ServerConfig::load(&cli.config)?.apply_env_overrides();
    if let Some(root) = cli.plugin_root {
        config.plugin_root = root;
    }

    tracing::info!(
        "Starting toolhost (plugin root: {})",
        config.plugin_root.display()
    );

    let host = ToolHost::new(config)?;
    let transport = io::stdio();

    match host.serve(transport).await {
        Ok(server) => match server.waiting().await {
            Ok(reason) => {
                tracing::info!("Server shutdown gracefully: {:?}", reason);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Server error during operation: {}", e);
                exit(1);
            }
        },
        Err(e) => {
            tracing::error!("Failed to initialize server: {}", e);
            exit(1);
        }
    }
}
