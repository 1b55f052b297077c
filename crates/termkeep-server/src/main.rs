use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use termkeep_server::{ServerConfig, server};

#[derive(Parser, Debug)]
#[command(name = "termkeep-server", about = "Persistent terminal sessions over WebSocket")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "TERMKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on; overrides the config file and environment
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termkeep_server=info,libtermkeep=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    server::run(config).await
}
