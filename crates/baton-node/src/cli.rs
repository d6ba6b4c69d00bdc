use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Baton - Lease driven redundant block production
#[derive(Parser)]
#[command(name = "baton")]
#[command(about = "Baton block producer and utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new node configuration
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "baton.json")]
        output: PathBuf,
    },

    /// Run every configured instance in one process against a shared
    /// in-memory store, each with its own simulated engine
    Devnet {
        /// Path to configuration file
        #[arg(short, long, default_value = "baton.json")]
        config: PathBuf,

        /// How long to run, in seconds (runs until Ctrl-C when omitted)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Stop the current leader after this many seconds
        #[arg(long)]
        kill_leader_after: Option<u64>,

        /// Take the leader's engine offline after this many seconds
        #[arg(long)]
        engine_outage_after: Option<u64>,

        /// Synthetic transactions submitted to the leader per second
        #[arg(long, default_value = "0")]
        tx_rate: u32,
    },
}
