//! Chain P2P node

mod home;
mod node;

use anyhow::{Context, Result};
use chain_network::NodeKey;
use clap::{Parser, Subcommand};
use home::Home;
use node::Node;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chain-node", version, about = "Peer-to-peer network node")]
struct Cli {
    /// Node home directory
    #[arg(long, global = true, env = "CHAIN_HOME", default_value = ".chain")]
    home: PathBuf,

    /// Log filter, e.g. "info" or "chain_network=debug"
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the home directory, node key and default config
    Init {
        /// Overwrite an existing key and config
        #[arg(long)]
        force: bool,
    },

    /// Print this node's ID
    ShowNodeId,

    /// Run the node until Ctrl-C
    Start {
        /// Comma separated id@host:port seeds
        #[arg(long, value_delimiter = ',')]
        seeds: Vec<String>,

        /// Comma separated id@host:port peers to keep connected
        #[arg(long, value_delimiter = ',')]
        persistent_peers: Vec<String>,

        /// Crawl the network instead of keeping a peer set
        #[arg(long)]
        seed_mode: bool,

        /// Listen address, overrides the config file
        #[arg(long)]
        laddr: Option<String>,
    },
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log filter")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json)?;
    let home = Home::new(cli.home);

    match cli.command {
        Command::Init { force } => {
            let key = home.init(force)?;
            info!("Initialized node {}", key.id());
        }
        Command::ShowNodeId => {
            let key = NodeKey::load_from_file(home.node_key_file())
                .context("reading node key, run `chain-node init` first")?;
            println!("{}", key.id());
        }
        Command::Start {
            seeds,
            persistent_peers,
            seed_mode,
            laddr,
        } => {
            let mut config = home.load_config()?;
            if !seeds.is_empty() {
                config.pex.seeds = seeds;
            }
            if !persistent_peers.is_empty() {
                config.persistent_peers = persistent_peers;
            }
            if seed_mode {
                config.pex.seed_mode = true;
            }
            if let Some(laddr) = laddr {
                config.listen_address = laddr;
            }

            let node = Node::new(&home, config)?;
            node.start().await?;
            info!("Press Ctrl+C to stop.");

            tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            node.stop().await;
        }
    }

    Ok(())
}
