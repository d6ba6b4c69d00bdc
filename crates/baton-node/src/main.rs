use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod config;
mod node;

use cli::{Cli, Commands};
use config::{generate_sample_config, NodeConfig};
use node::{Devnet, DevnetPlan};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => {
            init_config(output)?;
        }
        Commands::Devnet {
            config,
            duration,
            kill_leader_after,
            engine_outage_after,
            tx_rate,
        } => {
            let plan = DevnetPlan {
                duration: duration.map(Duration::from_secs),
                kill_leader_after: kill_leader_after.map(Duration::from_secs),
                engine_outage_after: engine_outage_after.map(Duration::from_secs),
                tx_rate,
            };
            run_devnet(config, plan).await?;
        }
    }

    Ok(())
}

/// Run every configured instance in this process
async fn run_devnet(config_path: PathBuf, plan: DevnetPlan) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);

    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        error!(
            "Configuration file not found: {:?}. Run 'baton init' to create one.",
            config_path
        );
        return Err(anyhow::anyhow!("Configuration file not found"));
    };

    let mut devnet = Devnet::start(&config).await?;
    let result = devnet.run(&plan).await;
    devnet.stop().await;
    result
}

/// Initialize a new configuration file
fn init_config(output: PathBuf) -> Result<()> {
    info!("Generating sample configuration");

    let config = generate_sample_config();
    config.save(&output)?;

    info!("Configuration saved to {:?}", output);
    info!("  Instances: {}", config.instances.join(", "));
    info!("  Genesis:   {}", config.genesis_block_hash);

    println!("\nConfiguration file created: {}", output.display());
    println!("Edit the file to customize your devnet settings.");
    println!("\nTo start the devnet, run:");
    println!("  baton devnet --config {}", output.display());

    Ok(())
}
