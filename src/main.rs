use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ptx_node::api;
use ptx_node::config::NodeConfig;
use ptx_node::domain::DomainRegistry;
use ptx_node::node::{Node, NodeDeps};
use ptx_node::testbed::{DevChain, DevIdentityResolver, DevKeyManager};
use ptx_node::transport::InProcessTransport;

#[derive(Parser)]
#[command(author, version, about = "Private transaction manager node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_node(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
    }

    Ok(())
}

/// Starts a node with the in-process development collaborators: a
/// simulated base ledger, deterministic identities, and a loopback
/// transport. Production deployments wire the plugin-backed equivalents
/// instead; domains always arrive as plugins and none are registered here.
async fn start_node(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        let config = NodeConfig::default();
        config.save(&config_path)?;
        config
    };

    let chain = DevChain::new();
    let (transport, transport_inbound) = InProcessTransport::new(config.node_name.clone());
    let deps = NodeDeps {
        registry: DomainRegistry::new(),
        resolver: Arc::new(DevIdentityResolver),
        keymgr: Arc::new(DevKeyManager),
        eth: chain.client(),
        transport: Arc::new(transport),
        transport_inbound,
        indexer: chain.subscribe(),
    };

    let rpc_addr = config.rpc_listen;
    let node = Node::new(config, deps)?;
    let handle = node.handle();
    let node_task = tokio::spawn(async move { node.start().await });
    let api_task = tokio::spawn(async move { api::serve(handle.api_state(), rpc_addr).await });

    let result = tokio::select! {
        res = node_task => handle_join(res),
        res = api_task => handle_join(res),
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    result?;
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn handle_join(result: Result<ptx_node::errors::EngineResult<()>, JoinError>) -> Result<()> {
    let inner = result?;
    inner?;
    Ok(())
}
