//! molt-net node binary.
//!
//! Binds a transport server, joins the network through the given seeds and
//! serves until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use molt_net::{NetAddress, Server, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "molt-net")]
#[command(version, about = "MOLT transport node", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, env = "MOLT_NET_CONFIG")]
    config: Option<PathBuf>,

    /// Interface to listen on.
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "MOLT_NET_PORT")]
    port: Option<u16>,

    /// Seed peer as host:port. Repeat for several seeds.
    #[arg(short, long = "seed")]
    seeds: Vec<NetAddress>,

    /// Maximum number of handlers running at once.
    #[arg(long)]
    max_handlers: Option<usize>,

    /// Ping announced peers before adding them.
    #[arg(long)]
    verify_announcements: bool,
}

impl Cli {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                ServerConfig::from_json(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => ServerConfig::default(),
        };

        if let Some(bind) = &self.bind {
            config = config.with_bind_host(bind.clone());
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max) = self.max_handlers {
            config = config.with_max_concurrent_handlers(max);
        }
        if self.verify_announcements {
            config = config.with_verify_announcements(true);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.server_config()?;

    let server = Server::bind(config).await.context("starting server")?;
    info!(addr = %server.local_addr(), "node started");

    let report = server.bootstrap(&cli.seeds).await.context("bootstrapping")?;
    if !cli.seeds.is_empty() && report.seeded.is_empty() {
        warn!("no seed answered; running without peers");
    }
    info!(
        own = %server.my_address(),
        peers = ?server.address_book(),
        "joined network"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    server.close().await?;
    Ok(())
}
