//! i2pbridge - operator tool for the BOB and SAM bridges
//!
//! Checks that a router's bridges are reachable, generates destinations,
//! resolves names and cleans up stale BOB tunnels.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use i2pbridge_client::{Api, BobClient, BridgeConfig, SamClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "i2pbridge")]
#[command(about = "Talk to an I2P router's BOB and SAM bridges")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, env = "I2PBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check which bridges are reachable
    TestApi {
        /// Only test this API (bob or sam)
        #[arg(short, long)]
        api: Option<Api>,
    },

    /// Generate a destination and store its private key
    GenerateDest {
        /// Where to write the private key; must not exist yet
        keyfile: PathBuf,

        /// Signature type requested from the router
        #[arg(short, long)]
        signature_type: Option<String>,
    },

    /// Resolve an .i2p hostname through SAM
    Lookup { name: String },

    /// Stop and remove a BOB tunnel
    RemoveTunnel { nickname: String },
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(BridgeConfig::default()),
    }
}

fn init_logging(config: &BridgeConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn test_api(config: &BridgeConfig, only: Option<Api>) -> Result<()> {
    let apis = match only {
        Some(api) => vec![api],
        None => Api::ALL.to_vec(),
    };

    let mut reachable = 0;
    for api in apis {
        match api.test(config).await {
            Ok(version) => {
                reachable += 1;
                println!("{} at {}: OK (version {})", api, api.address(config), version);
            }
            Err(e) => {
                warn!("{} at {} failed: {}", api, api.address(config), e);
                println!("{} at {}: unavailable ({})", api, api.address(config), e);
            }
        }
    }

    if reachable == 0 {
        anyhow::bail!("No bridge API is reachable");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    init_logging(&config);

    match args.command {
        Command::TestApi { api } => test_api(&config, api).await?,
        Command::GenerateDest {
            keyfile,
            signature_type,
        } => {
            let address = SamClient::tcp(&config)
                .generate_destination(&keyfile, signature_type)
                .await
                .with_context(|| format!("Failed to generate destination into {}", keyfile.display()))?;
            info!("Private key written to {}", keyfile.display());
            println!("{}", address.destination());
            println!("{}", address.host());
        }
        Command::Lookup { name } => {
            let address = SamClient::tcp(&config)
                .lookup(&name)
                .await
                .with_context(|| format!("Failed to resolve {}", name))?;
            println!("{}", address.destination());
        }
        Command::RemoveTunnel { nickname } => {
            let removed = BobClient::tcp(&config)
                .remove_tunnel(&nickname)
                .await
                .with_context(|| format!("Failed to remove tunnel {}", nickname))?;
            if removed {
                println!("Removed tunnel {}", nickname);
            } else {
                println!("No tunnel named {}", nickname);
            }
        }
    }

    Ok(())
}
