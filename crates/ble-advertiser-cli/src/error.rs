//! Error handling for the simulator

use thiserror::Error;

use ble_advertiser::AdvertiserError;

/// Simulator error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid scenario step {index} at {at_ms}ms: {reason}")]
    InvalidStep {
        index: usize,
        at_ms: u64,
        reason: String,
    },

    #[error("Advertiser error: {0}")]
    Advertiser(#[from] AdvertiserError),

    #[error("Simulation failed: {0}")]
    Simulation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, CliError>;
