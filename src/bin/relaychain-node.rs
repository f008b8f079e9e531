#![forbid(unsafe_code)]
//! RelayChain node runner

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaychain::config::load_config;
use relaychain::keyring::Keyring;
use relaychain::node::Node;
use relaychain::payload::PayloadKind;

#[derive(Parser)]
#[command(author, version, about = "Permissioned blockchain node")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Truncate the stored chain at the first broken block instead of stopping
    #[arg(long)]
    autofix: bool,
    /// Log every replayed block
    #[arg(short, long)]
    verbose: bool,
    /// Generate a keyring of this many keys and submit it as a block
    #[arg(long)]
    emit_keyring: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    config.ledger.autofix |= cli.autofix;
    config.ledger.verbose |= cli.verbose;
    let keyfile = config.work_dir().join("emitted_keys.json");

    let node = Node::init(config)?;
    if let Err(e) = node.start().await {
        error!("Node failed to start: {}", e);
        std::process::exit(1);
    }

    if let Some(count) = cli.emit_keyring {
        let keyring = Keyring::generate(count, node.identity(), &keyfile)?;
        let mut signable = keyring.to_signable()?;
        signable.sign_with(node.identity())?;
        let id = node.submit(&signable.to_canonical_json()?, None).await?;
        info!("Keyring of {} keys submitted (tracking id {})", count, id);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.shutdown();
    Ok(())
}
