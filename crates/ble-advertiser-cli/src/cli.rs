//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ble-advertiser-sim")]
#[command(author, version, about = "Run BLE advertisement scheduling scenarios against a simulated controller", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario file and print what happened
    Run {
        /// Scenario file (TOML)
        scenario: PathBuf,
        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Check a scenario file without running it
    Validate {
        /// Scenario file (TOML)
        scenario: PathBuf,
    },
    /// Print an example scenario file
    Example,
}
