//! Advertisements that retry hardware failures until they succeed
//!
//! Registering or unregistering an advertisement with the Bluetooth stack can
//! fail transiently (adapter busy, too many advertisements, power cycling).
//! [`RetryingAdvertisement`] hides this from the slot manager: it keeps
//! registering with exponential backoff until the stack accepts it, and once
//! stopped keeps unregistering until the stack lets it go. Only then is the
//! stop callback invoked.
//!
//! All hardware commands go through one [`BleSynchronizer`], so at most one
//! is in flight and consecutive commands can be spaced out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::advertisement::{
    AdvertisementFactory, ErrorTolerantAdvertisement, ServiceData, StopCallback,
};
use crate::config::{AdvertiserConfig, RetryConfig};
use crate::error::BackendError;
use crate::types::DeviceIdPair;

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

/// The platform Bluetooth stack, seen as register/unregister calls
#[async_trait]
pub trait AdvertisementBackend: Send + Sync + 'static {
    /// Token identifying a registered advertisement
    type Registration: Send + Sync + 'static;

    async fn register(
        &self,
        device_id_pair: &DeviceIdPair,
        service_data: &ServiceData,
    ) -> Result<Self::Registration, BackendError>;

    async fn unregister(&self, registration: &Self::Registration) -> Result<(), BackendError>;
}

// ----------------------------------------------------------------------------
// Synchronizer
// ----------------------------------------------------------------------------

/// Serializes hardware commands and keeps them `min_interval` apart
#[derive(Debug)]
pub struct BleSynchronizer {
    min_interval: Duration,
    last_command: Mutex<Option<Instant>>,
}

impl BleSynchronizer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_command: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Run `command` once no other command is in flight and the spacing
    /// since the previous command has elapsed
    pub async fn run<F, T>(&self, command: F) -> T
    where
        F: Future<Output = T>,
    {
        let mut last_command = self.last_command.lock().await;
        if let Some(previous) = *last_command {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }

        let output = command.await;
        *last_command = Some(Instant::now());
        output
    }
}

impl Default for BleSynchronizer {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

// ----------------------------------------------------------------------------
// Retrying Advertisement
// ----------------------------------------------------------------------------

/// Handle to a spawned task that owns one hardware advertisement.
///
/// Dropping the handle without calling `stop` still unregisters the
/// advertisement, but no callback is invoked.
pub struct RetryingAdvertisement {
    device_id_pair: DeviceIdPair,
    stop_sender: Option<oneshot::Sender<StopCallback>>,
}

impl RetryingAdvertisement {
    /// Start registering on a new tokio task
    pub fn spawn<B: AdvertisementBackend>(
        backend: Arc<B>,
        synchronizer: Arc<BleSynchronizer>,
        retry: RetryConfig,
        device_id_pair: DeviceIdPair,
        service_data: ServiceData,
    ) -> Self {
        let (stop_sender, stop_receiver) = oneshot::channel();
        let lifecycle = AdvertisementLifecycle {
            backend,
            synchronizer,
            retry,
            device_id_pair: device_id_pair.clone(),
            service_data,
        };
        tokio::spawn(lifecycle.run(stop_receiver));

        Self {
            device_id_pair,
            stop_sender: Some(stop_sender),
        }
    }
}

impl ErrorTolerantAdvertisement for RetryingAdvertisement {
    fn device_id_pair(&self) -> &DeviceIdPair {
        &self.device_id_pair
    }

    fn stop(&mut self, on_stopped: StopCallback) {
        let Some(stop_sender) = self.stop_sender.take() else {
            debug!(
                "Ignoring repeated stop for advertisement {}",
                self.device_id_pair
            );
            return;
        };

        // The task only ends on its own after a stop, so a closed channel
        // means it died; complete the stop here.
        if let Err(on_stopped) = stop_sender.send(on_stopped) {
            warn!(
                "Advertisement task for {} is gone; completing stop immediately",
                self.device_id_pair
            );
            on_stopped();
        }
    }

    fn has_been_stopped(&self) -> bool {
        self.stop_sender.is_none()
    }
}

struct AdvertisementLifecycle<B: AdvertisementBackend> {
    backend: Arc<B>,
    synchronizer: Arc<BleSynchronizer>,
    retry: RetryConfig,
    device_id_pair: DeviceIdPair,
    service_data: ServiceData,
}

impl<B: AdvertisementBackend> AdvertisementLifecycle<B> {
    async fn run(self, mut stop_receiver: oneshot::Receiver<StopCallback>) {
        let mut attempt = 0;
        let registration = loop {
            let result = self
                .synchronizer
                .run(self.backend.register(&self.device_id_pair, &self.service_data))
                .await;

            match result {
                Ok(registration) => break registration,
                Err(error) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        "Registering advertisement for {} failed (attempt {}): {}; retrying in {:?}",
                        self.device_id_pair, attempt, error, delay
                    );

                    // Only the backoff is cancellable; an in-flight command
                    // always runs to completion.
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        stop = &mut stop_receiver => {
                            debug!(
                                "Advertisement {} stopped before registration succeeded",
                                self.device_id_pair
                            );
                            if let Ok(on_stopped) = stop {
                                on_stopped();
                            }
                            return;
                        }
                    }
                }
            }
        };

        info!("Advertising {}", self.device_id_pair);
        let stop = stop_receiver.await;

        self.unregister(&registration).await;
        info!("Stopped advertising {}", self.device_id_pair);

        if let Ok(on_stopped) = stop {
            on_stopped();
        }
    }

    async fn unregister(&self, registration: &B::Registration) {
        let mut attempt = 0;
        loop {
            let result = self
                .synchronizer
                .run(self.backend.unregister(registration))
                .await;

            let Err(error) = result else {
                return;
            };

            let delay = self.retry.delay_for(attempt);
            attempt += 1;
            warn!(
                "Unregistering advertisement for {} failed (attempt {}): {}; retrying in {:?}",
                self.device_id_pair, attempt, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

/// Creates [`RetryingAdvertisement`]s sharing one backend and synchronizer.
///
/// `create` spawns a task, so the factory must be used inside a tokio runtime.
pub struct RetryingAdvertisementFactory<B: AdvertisementBackend> {
    backend: Arc<B>,
    synchronizer: Arc<BleSynchronizer>,
    retry: RetryConfig,
}

impl<B: AdvertisementBackend> RetryingAdvertisementFactory<B> {
    pub fn new(backend: B, config: &AdvertiserConfig) -> Self {
        Self::with_synchronizer(
            Arc::new(backend),
            Arc::new(BleSynchronizer::new(config.min_command_interval())),
            config.retry.clone(),
        )
    }

    pub fn with_synchronizer(
        backend: Arc<B>,
        synchronizer: Arc<BleSynchronizer>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            backend,
            synchronizer,
            retry,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

impl<B: AdvertisementBackend> AdvertisementFactory for RetryingAdvertisementFactory<B> {
    fn create(
        &self,
        device_id_pair: &DeviceIdPair,
        service_data: ServiceData,
    ) -> Box<dyn ErrorTolerantAdvertisement> {
        debug!(
            "Creating advertisement for {} with {:?}",
            device_id_pair, service_data
        );
        Box::new(RetryingAdvertisement::spawn(
            Arc::clone(&self.backend),
            Arc::clone(&self.synchronizer),
            self.retry.clone(),
            device_id_pair.clone(),
            service_data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct BackendState {
        failing_registrations: usize,
        failing_unregistrations: usize,
        register_calls: usize,
        unregister_calls: usize,
        registered: HashSet<DeviceIdPair>,
        command_times: Vec<Instant>,
    }

    #[derive(Default)]
    struct FlakyBackend {
        state: StdMutex<BackendState>,
    }

    impl FlakyBackend {
        fn failing(registrations: usize, unregistrations: usize) -> Self {
            let backend = Self::default();
            {
                let mut state = backend.state.lock().unwrap();
                state.failing_registrations = registrations;
                state.failing_unregistrations = unregistrations;
            }
            backend
        }

        fn snapshot<T>(&self, read: impl FnOnce(&BackendState) -> T) -> T {
            read(&self.state.lock().unwrap())
        }
    }

    #[async_trait]
    impl AdvertisementBackend for FlakyBackend {
        type Registration = DeviceIdPair;

        async fn register(
            &self,
            device_id_pair: &DeviceIdPair,
            _service_data: &ServiceData,
        ) -> Result<DeviceIdPair, BackendError> {
            let mut state = self.state.lock().unwrap();
            state.register_calls += 1;
            state.command_times.push(Instant::now());
            if state.failing_registrations > 0 {
                state.failing_registrations -= 1;
                return Err(BackendError::RegistrationFailed("adapter busy".into()));
            }
            state.registered.insert(device_id_pair.clone());
            Ok(device_id_pair.clone())
        }

        async fn unregister(&self, registration: &DeviceIdPair) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.unregister_calls += 1;
            state.command_times.push(Instant::now());
            if state.failing_unregistrations > 0 {
                state.failing_unregistrations -= 1;
                return Err(BackendError::UnregistrationFailed("adapter busy".into()));
            }
            state.registered.remove(registration);
            Ok(())
        }
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_factor: 2.0,
        }
    }

    fn pair() -> DeviceIdPair {
        DeviceIdPair::new("remote", "local")
    }

    fn spawn(backend: &Arc<FlakyBackend>) -> RetryingAdvertisement {
        RetryingAdvertisement::spawn(
            Arc::clone(backend),
            Arc::new(BleSynchronizer::default()),
            retry(),
            pair(),
            ServiceData::new(vec![1, 2, 3], 0, 1),
        )
    }

    fn stop_and_wait(advertisement: &mut RetryingAdvertisement) -> oneshot::Receiver<()> {
        let (done, stopped) = oneshot::channel();
        advertisement.stop(Box::new(move || {
            let _ = done.send(());
        }));
        stopped
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_then_unregisters_on_stop() {
        let backend = Arc::new(FlakyBackend::default());
        let mut advertisement = spawn(&backend);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(backend.snapshot(|state| state.registered.contains(&pair())));
        assert!(!advertisement.has_been_stopped());

        let stopped = stop_and_wait(&mut advertisement);
        assert!(advertisement.has_been_stopped());
        stopped.await.unwrap();

        assert!(backend.snapshot(|state| state.registered.is_empty()));
        assert_eq!(backend.snapshot(|state| state.unregister_calls), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_retries_with_backoff() {
        let backend = Arc::new(FlakyBackend::failing(3, 0));
        let _advertisement = spawn(&backend);

        // Attempts at t=0, 100ms, 300ms and 700ms.
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(backend.snapshot(|state| state.register_calls), 3);
        assert!(backend.snapshot(|state| state.registered.is_empty()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.snapshot(|state| state.register_calls), 4);
        assert!(backend.snapshot(|state| state.registered.contains(&pair())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_failing_registration_skips_retries() {
        let backend = Arc::new(FlakyBackend::failing(usize::MAX, 0));
        let mut advertisement = spawn(&backend);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let calls_before_stop = backend.snapshot(|state| state.register_calls);
        assert_eq!(calls_before_stop, 2);

        stop_and_wait(&mut advertisement).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.snapshot(|state| state.register_calls), calls_before_stop);
        assert_eq!(backend.snapshot(|state| state.unregister_calls), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_waits_for_unregistration() {
        let backend = Arc::new(FlakyBackend::failing(0, 2));
        let mut advertisement = spawn(&backend);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut stopped = stop_and_wait(&mut advertisement);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stopped.try_recv().is_err());

        stopped.await.unwrap();
        assert_eq!(backend.snapshot(|state| state.unregister_calls), 3);
        assert!(backend.snapshot(|state| state.registered.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_still_unregisters() {
        let backend = Arc::new(FlakyBackend::default());
        let advertisement = spawn(&backend);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(backend.snapshot(|state| !state.registered.is_empty()));

        drop(advertisement);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(backend.snapshot(|state| state.registered.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_stop_is_ignored() {
        let backend = Arc::new(FlakyBackend::default());
        let mut advertisement = spawn(&backend);

        let first = stop_and_wait(&mut advertisement);
        let second = stop_and_wait(&mut advertisement);

        first.await.unwrap();
        assert!(second.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronizer_spaces_commands() {
        let synchronizer = BleSynchronizer::new(Duration::from_millis(500));
        let start = Instant::now();

        let first = synchronizer.run(async { Instant::now() }).await;
        let second = synchronizer.run(async { Instant::now() }).await;

        assert_eq!(first, start);
        assert_eq!(second - first, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_shares_synchronizer() {
        let config = AdvertiserConfig::new().with_min_command_interval(Duration::from_millis(200));
        let factory = RetryingAdvertisementFactory::new(FlakyBackend::default(), &config);

        let _first = factory.create(&DeviceIdPair::new("a", "x"), ServiceData::new(vec![], 0, 1));
        let _second = factory.create(&DeviceIdPair::new("b", "x"), ServiceData::new(vec![], 0, 1));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let times = factory.backend().snapshot(|state| state.command_times.clone());
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_millis(200));
    }
}
