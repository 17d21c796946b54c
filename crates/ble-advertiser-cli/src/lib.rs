//! Scenario simulator for the BLE advertisement slot scheduler
//!
//! Replays a timeline of advertisement requests against a simulated
//! Bluetooth controller and reports how the slots rotated.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod provider;
pub mod sim;

pub use backend::{BackendStats, SimulatedBackend};
pub use cli::{Cli, Commands};
pub use config::{BackendConfig, SimConfig, Step, StepAction};
pub use error::{CliError, Result};
pub use provider::RotatingServiceDataProvider;
pub use sim::{format_report, format_status, SimReport};
