//! Simulated Bluetooth controller
//!
//! Commands take a fixed latency, fail with a configured probability and the
//! controller holds a limited number of advertisements. Registering past that
//! limit fails the same way a real controller rejects it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use ble_advertiser::{AdvertisementBackend, BackendError, DeviceIdPair, ServiceData};

use crate::config::BackendConfig;

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub registrations: u64,
    pub unregistrations: u64,
    pub failed_commands: u64,
    pub peak_active: usize,
}

struct ControllerState {
    rng: fastrand::Rng,
    next_id: u64,
    active: HashMap<u64, DeviceIdPair>,
    stats: BackendStats,
}

pub struct SimulatedBackend {
    latency: Duration,
    failure_rate: f64,
    hardware_slots: usize,
    state: Mutex<ControllerState>,
}

impl SimulatedBackend {
    pub fn new(config: &BackendConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };

        Self {
            latency: config.latency(),
            failure_rate: config.failure_rate,
            hardware_slots: config.hardware_slots,
            state: Mutex::new(ControllerState {
                rng,
                next_id: 0,
                active: HashMap::new(),
                stats: BackendStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> BackendStats {
        self.lock().stats.clone()
    }

    /// Requests currently advertised by the controller
    pub fn active(&self) -> Vec<DeviceIdPair> {
        let mut active: Vec<DeviceIdPair> = self.lock().active.values().cloned().collect();
        active.sort();
        active
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_fail(&self, state: &mut ControllerState) -> bool {
        let failed = state.rng.f64() < self.failure_rate;
        if failed {
            state.stats.failed_commands += 1;
        }
        failed
    }
}

#[async_trait]
impl AdvertisementBackend for SimulatedBackend {
    type Registration = u64;

    async fn register(
        &self,
        device_id_pair: &DeviceIdPair,
        service_data: &ServiceData,
    ) -> Result<u64, BackendError> {
        tokio::time::sleep(self.latency).await;

        let mut state = self.lock();
        if self.should_fail(&mut state) {
            return Err(BackendError::RegistrationFailed(
                "simulated controller error".to_string(),
            ));
        }
        if state.active.len() >= self.hardware_slots {
            state.stats.failed_commands += 1;
            return Err(BackendError::RegistrationFailed(format!(
                "controller already holds {} advertisements",
                self.hardware_slots
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.active.insert(id, device_id_pair.clone());
        state.stats.registrations += 1;
        state.stats.peak_active = state.stats.peak_active.max(state.active.len());

        debug!(
            "Controller registered #{} for {} with {:?}",
            id, device_id_pair, service_data
        );
        Ok(id)
    }

    async fn unregister(&self, registration: &u64) -> Result<(), BackendError> {
        tokio::time::sleep(self.latency).await;

        let mut state = self.lock();
        if self.should_fail(&mut state) {
            return Err(BackendError::UnregistrationFailed(
                "simulated controller error".to_string(),
            ));
        }

        if let Some(device_id_pair) = state.active.remove(registration) {
            state.stats.unregistrations += 1;
            debug!("Controller unregistered #{} for {}", registration, device_id_pair);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> ServiceData {
        ServiceData::new(vec![0xAA], 0, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_respects_hardware_slots() {
        let backend = SimulatedBackend::new(&BackendConfig {
            hardware_slots: 1,
            ..Default::default()
        });
        let first = DeviceIdPair::new("a", "x");
        let second = DeviceIdPair::new("b", "x");

        let id = backend.register(&first, &data()).await.unwrap();
        assert!(backend.register(&second, &data()).await.is_err());

        backend.unregister(&id).await.unwrap();
        assert!(backend.register(&second, &data()).await.is_ok());
        assert_eq!(backend.active(), vec![second]);

        let stats = backend.stats();
        assert_eq!(stats.registrations, 2);
        assert_eq!(stats.unregistrations, 1);
        assert_eq!(stats.failed_commands, 1);
        assert_eq!(stats.peak_active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_take_configured_latency() {
        let backend = SimulatedBackend::new(&BackendConfig {
            latency_ms: 250,
            ..Default::default()
        });

        let start = tokio::time::Instant::now();
        backend
            .register(&DeviceIdPair::new("a", "x"), &data())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_failures_are_reproducible() {
        let config = BackendConfig {
            failure_rate: 0.5,
            hardware_slots: 100,
            seed: Some(42),
            ..Default::default()
        };

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let backend = SimulatedBackend::new(&config);
            let mut run = Vec::new();
            for n in 0..20 {
                let pair = DeviceIdPair::new(format!("r{n}"), "x");
                run.push(backend.register(&pair, &data()).await.is_ok());
            }
            outcomes.push(run);
        }

        assert_eq!(outcomes[0], outcomes[1]);
        assert!(outcomes[0].contains(&true));
        assert!(outcomes[0].contains(&false));
    }
}
