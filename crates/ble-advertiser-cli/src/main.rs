//! BLE advertiser simulator entry point

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ble_advertiser_cli::{
    cli::{Cli, Commands},
    config::SimConfig,
    sim,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run { scenario, json } => {
            info!("Loading scenario from: {}", scenario.display());
            let config = SimConfig::load_from_file(&scenario)
                .with_context(|| format!("failed to load {}", scenario.display()))?;

            let report = sim::run(&config).await.context("scenario failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", sim::format_report(&report));
            }

            if !report.leaked.is_empty() {
                anyhow::bail!(
                    "{} advertisements still registered after shutdown",
                    report.leaked.len()
                );
            }
        }
        Commands::Validate { scenario } => {
            let config = SimConfig::load_from_file(&scenario)
                .with_context(|| format!("failed to load {}", scenario.display()))?;
            println!(
                "{}: ok ({} steps over {}ms)",
                scenario.display(),
                config.steps.len(),
                config.run_for_ms
            );
        }
        Commands::Example => {
            print!("{}", SimConfig::example_toml()?);
        }
    }

    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}
