//! Scenario configuration
//!
//! A scenario is a TOML file with the advertiser configuration, the behaviour
//! of the simulated controller, and a timeline of requests:
//!
//! ```toml
//! run_for_ms = 30000
//!
//! [advertiser]
//! max_concurrent_advertisements = 2
//! timeslot_duration_ms = 5000
//!
//! [backend]
//! latency_ms = 20
//! failure_rate = 0.1
//!
//! [[steps]]
//! at_ms = 0
//! action = "add"
//! remote = "phone"
//! local = "laptop"
//! priority = "high"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ble_advertiser::{AdvertiserConfig, ConnectionPriority, DeviceIdPair};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Scenario Configuration
// ----------------------------------------------------------------------------

/// Complete description of one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Total simulated run time
    pub run_for_ms: u64,

    /// Slot manager configuration
    pub advertiser: AdvertiserConfig,

    /// Simulated controller behaviour
    pub backend: BackendConfig,

    /// Timeline of requests, applied in `at_ms` order
    pub steps: Vec<Step>,
}

/// Behaviour of the simulated Bluetooth controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Time each register/unregister command takes
    pub latency_ms: u64,

    /// Probability in `[0, 1)` that a command fails
    pub failure_rate: f64,

    /// Advertisements the controller can hold at once
    pub hardware_slots: usize,

    /// Seed for reproducible failures
    pub seed: Option<u64>,
}

/// One timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Add {
        remote: String,
        local: String,
        priority: ConnectionPriority,
    },
    Update {
        remote: String,
        local: String,
        priority: ConnectionPriority,
    },
    Remove {
        remote: String,
        local: String,
    },
    /// Log the advertiser status
    Status,
}

impl StepAction {
    /// The request this step targets, if any
    pub fn device_id_pair(&self) -> Option<DeviceIdPair> {
        match self {
            Self::Add { remote, local, .. }
            | Self::Update { remote, local, .. }
            | Self::Remove { remote, local } => Some(DeviceIdPair::new(remote, local)),
            Self::Status => None,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            run_for_ms: 30_000,
            advertiser: AdvertiserConfig::default(),
            backend: BackendConfig::default(),
            steps: Vec::new(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            failure_rate: 0.0,
            hardware_slots: 2,
            seed: None,
        }
    }
}

impl BackendConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl SimConfig {
    pub fn run_for(&self) -> Duration {
        Duration::from_millis(self.run_for_ms)
    }

    /// Load, order and validate a scenario file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parse, order and validate a scenario
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: SimConfig = toml::from_str(contents)?;
        config.steps.sort_by_key(|step| step.at_ms);
        config.validate()?;
        Ok(config)
    }

    /// Validate the scenario for consistency.
    ///
    /// Steps are replayed against a tracked set so a scenario can never ask
    /// the advertiser to add a tracked request or touch an untracked one.
    pub fn validate(&self) -> Result<()> {
        self.advertiser.validate()?;

        if !(0.0..1.0).contains(&self.backend.failure_rate) {
            return Err(CliError::Config(format!(
                "backend.failure_rate must be in [0, 1), got {}",
                self.backend.failure_rate
            )));
        }
        if self.backend.hardware_slots == 0 {
            return Err(CliError::Config(
                "backend.hardware_slots must be at least 1".to_string(),
            ));
        }

        let mut tracked = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            let invalid = |reason: String| CliError::InvalidStep {
                index,
                at_ms: step.at_ms,
                reason,
            };

            if step.at_ms > self.run_for_ms {
                return Err(invalid(format!(
                    "scheduled after the end of the run ({}ms)",
                    self.run_for_ms
                )));
            }

            let Some(request) = step.action.device_id_pair() else {
                continue;
            };
            match step.action {
                StepAction::Add { .. } => {
                    if !tracked.insert(request.clone()) {
                        return Err(invalid(format!("{request} is already added")));
                    }
                }
                StepAction::Update { .. } => {
                    if !tracked.contains(&request) {
                        return Err(invalid(format!("{request} is not added")));
                    }
                }
                StepAction::Remove { .. } => {
                    if !tracked.remove(&request) {
                        return Err(invalid(format!("{request} is not added")));
                    }
                }
                StepAction::Status => {}
            }
        }

        Ok(())
    }

    /// Example scenario exercising rotation, preemption and removal
    pub fn example() -> Self {
        let add = |at_ms, remote: &str, priority| Step {
            at_ms,
            action: StepAction::Add {
                remote: remote.to_string(),
                local: "laptop".to_string(),
                priority,
            },
        };

        Self {
            run_for_ms: 20_000,
            advertiser: AdvertiserConfig::new()
                .with_max_concurrent_advertisements(2)
                .with_timeslot_duration(Duration::from_secs(4))
                .with_min_command_interval(Duration::from_millis(50)),
            backend: BackendConfig {
                latency_ms: 20,
                failure_rate: 0.1,
                hardware_slots: 2,
                seed: Some(7),
            },
            steps: vec![
                add(0, "phone", ConnectionPriority::Low),
                add(0, "watch", ConnectionPriority::Low),
                add(1_000, "tablet", ConnectionPriority::Low),
                Step {
                    at_ms: 6_000,
                    action: StepAction::Update {
                        remote: "tablet".to_string(),
                        local: "laptop".to_string(),
                        priority: ConnectionPriority::High,
                    },
                },
                Step {
                    at_ms: 10_000,
                    action: StepAction::Status,
                },
                Step {
                    at_ms: 12_000,
                    action: StepAction::Remove {
                        remote: "watch".to_string(),
                        local: "laptop".to_string(),
                    },
                },
            ],
        }
    }

    /// Example scenario as TOML
    pub fn example_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Self::example())?)
    }
}
