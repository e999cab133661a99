//! Stowage node - storage provider daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use stowage_dht::{Dht, DhtNetwork, StaticNetwork, UdpNetwork};
use stowage_identity::{Keypair, PublicKey};
use stowage_node::observability::{init_logging, LogFormat};
use stowage_node::config::Discovery;
use stowage_node::{keys, Node, NodeConfig, NodeOptions, StaticDirectory};
use stowage_storage::{Storage, Template};
use tokio::net::TcpListener;

/// Stowage - replicated repository storage
#[derive(Parser, Debug)]
#[command(name = "stowage-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "stowage.yaml")]
    config: PathBuf,

    /// Storage base directory
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Sync listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node
    Run,

    /// Create a repository
    Create {
        /// Directory to copy into the new repository
        #[arg(short, long)]
        from: Option<PathBuf>,
    },

    /// List stored repositories
    List,

    /// Show the node public key
    Key,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if let Some(base_path) = &self.base_path {
            config.base_path.clone_from(base_path);
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        if self.json {
            config.log_json = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.node_config()?;
    init_logging(&config.log_level, LogFormat::from_json_flag(config.log_json));

    let storage = Arc::new(
        Storage::open(config.storage())
            .await
            .context("opening storage")?,
    );

    match cli.command {
        Commands::Run => run(config, storage).await,
        Commands::Create { from } => {
            let (id, _) = storage.create(from.map(Template::directory)).await?;
            println!("{id}");
            Ok(())
        }
        Commands::List => {
            for id in storage.ids().await? {
                println!("{id}");
            }
            Ok(())
        }
        Commands::Key => {
            let keypair = keys::load_or_generate(&storage.keys_path()).await?;
            println!("{}", keypair.public_key());
            Ok(())
        }
    }
}

async fn run(config: NodeConfig, storage: Arc<Storage>) -> Result<()> {
    let keypair = keys::load_or_generate(&storage.keys_path()).await?;
    let directory =
        StaticDirectory::from_hex(&config.providers).context("parsing provider keys")?;
    if directory.is_empty() {
        tracing::warn!("no storage providers configured, nothing to sync with");
    }

    match config.discovery {
        Discovery::Udp => {
            let network = UdpNetwork::bind(config.dht_addr, config.udp())
                .await
                .with_context(|| format!("binding dht socket {}", config.dht_addr))?;
            serve(config, storage, keypair, directory, network).await
        }
        Discovery::Static => {
            let mut peers = Vec::with_capacity(config.peers.len());
            for (key, addr) in &config.peers {
                let key: PublicKey =
                    key.parse().with_context(|| format!("parsing peer key {key}"))?;
                peers.push((key.to_string(), *addr));
            }
            let network = StaticNetwork::new(peers);
            serve(config, storage, keypair, directory, network).await
        }
    }
}

async fn serve<N: DhtNetwork>(
    config: NodeConfig,
    storage: Arc<Storage>,
    keypair: Keypair,
    directory: StaticDirectory,
    network: N,
) -> Result<()> {
    let dht = Dht::new(
        network,
        &keypair.public_key().to_string(),
        config.announced_ports(),
        config.dht(),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    let node = Arc::new(Node::new(
        keypair,
        storage,
        directory,
        dht,
        NodeOptions::from(&config),
    ));

    node.run(listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    })
    .await;

    Ok(())
}
