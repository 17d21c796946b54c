//! In-memory collaborators for driving a [`BleAdvertiser`] deterministically
//!
//! Fake timers never fire on their own and fake advertisements never finish
//! stopping on their own; tests do both explicitly through probes, then let
//! the advertiser apply the resulting events with
//! [`BleAdvertiser::process_pending_events`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::advertisement::{
    AdvertisementFactory, ErrorTolerantAdvertisement, ServiceData, ServiceDataProvider,
    StopCallback,
};
use crate::advertiser::{BleAdvertiser, SlotState};
use crate::config::AdvertiserConfig;
use crate::delegate::{Delegate, SlotEnded};
use crate::timer::{OneShotTimer, TimerCallback, TimerFactory};
use crate::types::{ConnectionPriority, DeviceIdPair};

pub const FAKE_START_TIMESTAMP_MS: i64 = 1337;
pub const FAKE_END_TIMESTAMP_MS: i64 = 13337;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Service Data
// ----------------------------------------------------------------------------

/// Advertises `"<remote>+<local>"` with a fixed validity window
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeServiceDataProvider;

impl ServiceDataProvider for FakeServiceDataProvider {
    fn generate_foreground_advertisement(&self, device_id_pair: &DeviceIdPair) -> ServiceData {
        let data = format!(
            "{}+{}",
            device_id_pair.remote_device_id(),
            device_id_pair.local_device_id()
        );
        ServiceData::new(data.into_bytes(), FAKE_START_TIMESTAMP_MS, FAKE_END_TIMESTAMP_MS)
    }
}

// ----------------------------------------------------------------------------
// Advertisements
// ----------------------------------------------------------------------------

#[derive(Default)]
struct AdvertisementRecord {
    stop_callback: Option<StopCallback>,
    stop_calls: usize,
    released: bool,
}

/// Test-side view of one fake advertisement
#[derive(Clone)]
pub struct FakeAdvertisementProbe {
    device_id_pair: DeviceIdPair,
    service_data: ServiceData,
    record: Arc<Mutex<AdvertisementRecord>>,
}

impl FakeAdvertisementProbe {
    pub fn device_id_pair(&self) -> &DeviceIdPair {
        &self.device_id_pair
    }

    pub fn service_data(&self) -> &ServiceData {
        &self.service_data
    }

    pub fn has_been_stopped(&self) -> bool {
        lock(&self.record).stop_calls > 0
    }

    /// Number of times `stop` was called, including ignored repeats
    pub fn stop_calls(&self) -> usize {
        lock(&self.record).stop_calls
    }

    /// Whether the advertiser still holds the handle
    pub fn is_alive(&self) -> bool {
        !lock(&self.record).released
    }

    /// Report the stop as complete. Returns `false` if there is no pending
    /// stop to complete.
    pub fn invoke_stop_callback(&self) -> bool {
        let callback = lock(&self.record).stop_callback.take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

struct FakeAdvertisement {
    device_id_pair: DeviceIdPair,
    record: Arc<Mutex<AdvertisementRecord>>,
}

impl ErrorTolerantAdvertisement for FakeAdvertisement {
    fn device_id_pair(&self) -> &DeviceIdPair {
        &self.device_id_pair
    }

    fn stop(&mut self, on_stopped: StopCallback) {
        let mut record = lock(&self.record);
        record.stop_calls += 1;
        if record.stop_calls == 1 {
            record.stop_callback = Some(on_stopped);
        }
    }

    fn has_been_stopped(&self) -> bool {
        lock(&self.record).stop_calls > 0
    }
}

impl Drop for FakeAdvertisement {
    fn drop(&mut self) {
        lock(&self.record).released = true;
    }
}

/// Records every advertisement it creates; clones share the record
#[derive(Clone, Default)]
pub struct FakeAdvertisementFactory {
    created: Arc<Mutex<Vec<FakeAdvertisementProbe>>>,
}

impl FakeAdvertisementFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_instances_created(&self) -> usize {
        lock(&self.created).len()
    }

    pub fn created(&self) -> Vec<FakeAdvertisementProbe> {
        lock(&self.created).clone()
    }

    pub fn last(&self) -> Option<FakeAdvertisementProbe> {
        lock(&self.created).last().cloned()
    }

    /// Advertisements the advertiser has not released yet
    pub fn alive(&self) -> Vec<FakeAdvertisementProbe> {
        lock(&self.created)
            .iter()
            .filter(|probe| probe.is_alive())
            .cloned()
            .collect()
    }
}

impl AdvertisementFactory for FakeAdvertisementFactory {
    fn create(
        &self,
        device_id_pair: &DeviceIdPair,
        service_data: ServiceData,
    ) -> Box<dyn ErrorTolerantAdvertisement> {
        let record = Arc::new(Mutex::new(AdvertisementRecord::default()));
        lock(&self.created).push(FakeAdvertisementProbe {
            device_id_pair: device_id_pair.clone(),
            service_data,
            record: Arc::clone(&record),
        });

        Box::new(FakeAdvertisement {
            device_id_pair: device_id_pair.clone(),
            record,
        })
    }
}

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

#[derive(Default)]
struct TimerRecord {
    callback: Option<TimerCallback>,
    delay: Option<Duration>,
}

/// Test-side view of one fake timer
#[derive(Clone)]
pub struct FakeTimerProbe {
    record: Arc<Mutex<TimerRecord>>,
}

impl FakeTimerProbe {
    pub fn is_running(&self) -> bool {
        lock(&self.record).callback.is_some()
    }

    pub fn current_delay(&self) -> Option<Duration> {
        lock(&self.record).delay
    }

    /// Expire the timer now. Returns `false` if it was not running.
    pub fn fire(&self) -> bool {
        let callback = lock(&self.record).callback.take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

struct FakeOneShotTimer {
    record: Arc<Mutex<TimerRecord>>,
}

impl OneShotTimer for FakeOneShotTimer {
    fn start(&mut self, delay: Duration, on_fire: TimerCallback) {
        let mut record = lock(&self.record);
        record.delay = Some(delay);
        record.callback = Some(on_fire);
    }

    fn stop(&mut self) {
        lock(&self.record).callback = None;
    }

    fn is_running(&self) -> bool {
        lock(&self.record).callback.is_some()
    }

    fn current_delay(&self) -> Option<Duration> {
        lock(&self.record).delay
    }
}

impl Drop for FakeOneShotTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Records every timer it creates; clones share the record
#[derive(Clone, Default)]
pub struct FakeTimerFactory {
    created: Arc<Mutex<Vec<FakeTimerProbe>>>,
}

impl FakeTimerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_instances_created(&self) -> usize {
        lock(&self.created).len()
    }

    pub fn last(&self) -> Option<FakeTimerProbe> {
        lock(&self.created).last().cloned()
    }

    pub fn running(&self) -> Vec<FakeTimerProbe> {
        lock(&self.created)
            .iter()
            .filter(|probe| probe.is_running())
            .cloned()
            .collect()
    }
}

impl TimerFactory for FakeTimerFactory {
    fn create_one_shot_timer(&self) -> Box<dyn OneShotTimer> {
        let record = Arc::new(Mutex::new(TimerRecord::default()));
        lock(&self.created).push(FakeTimerProbe {
            record: Arc::clone(&record),
        });
        Box::new(FakeOneShotTimer { record })
    }
}

// ----------------------------------------------------------------------------
// Delegate
// ----------------------------------------------------------------------------

/// Collects slot-ended notifications in call order
#[derive(Clone, Default)]
pub struct RecordingDelegate {
    ended: Arc<Mutex<Vec<SlotEnded>>>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ended_advertisements(&self) -> Vec<SlotEnded> {
        lock(&self.ended).clone()
    }

    pub fn last_ended(&self) -> Option<SlotEnded> {
        lock(&self.ended).last().cloned()
    }
}

impl Delegate for RecordingDelegate {
    fn on_advertising_slot_ended(
        &self,
        device_id_pair: &DeviceIdPair,
        replaced_by_higher_priority: bool,
    ) {
        lock(&self.ended).push(SlotEnded {
            device_id_pair: device_id_pair.clone(),
            replaced_by_higher_priority,
        });
    }
}

// ----------------------------------------------------------------------------
// Test Bench
// ----------------------------------------------------------------------------

/// A [`BleAdvertiser`] wired to fakes, with handles on every fake
pub struct TestBench {
    pub advertiser: BleAdvertiser,
    pub advertisements: FakeAdvertisementFactory,
    pub timers: FakeTimerFactory,
    pub delegate: RecordingDelegate,
}

impl TestBench {
    /// # Panics
    /// If `slots` is zero.
    pub fn new(slots: usize) -> Self {
        Self::with_config(AdvertiserConfig::new().with_max_concurrent_advertisements(slots))
    }

    pub fn with_config(config: AdvertiserConfig) -> Self {
        let advertisements = FakeAdvertisementFactory::new();
        let timers = FakeTimerFactory::new();
        let delegate = RecordingDelegate::new();

        let advertiser = BleAdvertiser::new(
            &config,
            Box::new(FakeServiceDataProvider),
            Box::new(advertisements.clone()),
            Box::new(timers.clone()),
            Box::new(delegate.clone()),
        );

        Self {
            advertiser,
            advertisements,
            timers,
            delegate,
        }
    }

    pub fn add(&mut self, request: DeviceIdPair, priority: ConnectionPriority) {
        self.advertiser.add_advertisement_request(request, priority);
    }

    pub fn process(&mut self) -> usize {
        self.advertiser.process_pending_events()
    }

    /// Expire `timer` and apply the resulting events
    pub fn fire(&mut self, timer: &FakeTimerProbe) {
        assert!(timer.fire(), "timer was not running");
        self.process();
    }

    /// Complete the pending stop of `advertisement` and apply the resulting
    /// events
    pub fn finish_stopping(&mut self, advertisement: &FakeAdvertisementProbe) {
        assert!(
            advertisement.invoke_stop_callback(),
            "advertisement for {} had no pending stop",
            advertisement.device_id_pair()
        );
        self.process();
    }

    pub fn last_timer(&self) -> FakeTimerProbe {
        self.timers
            .last()
            .unwrap_or_else(|| panic!("no timer created"))
    }

    /// The most recently created advertisement, which must be for `request`
    pub fn last_advertisement(&self, request: &DeviceIdPair) -> FakeAdvertisementProbe {
        let last = self
            .advertisements
            .last()
            .unwrap_or_else(|| panic!("no advertisement created"));
        assert_eq!(last.device_id_pair(), request);
        last
    }

    /// The most recently created advertisement for `request`
    pub fn last_advertisement_for(&self, request: &DeviceIdPair) -> FakeAdvertisementProbe {
        self.advertisements
            .created()
            .into_iter()
            .rev()
            .find(|probe| probe.device_id_pair() == request)
            .unwrap_or_else(|| panic!("no advertisement created for {request}"))
    }

    /// Complete every pending stop, repeating until none are left
    pub fn finish_all_stops(&mut self) {
        loop {
            let mut completed = 0;
            for probe in self.advertisements.created() {
                if probe.invoke_stop_callback() {
                    completed += 1;
                }
            }
            if completed == 0 {
                break;
            }
            self.process();
        }
    }

    /// Nothing tracked, nothing running, every advertisement stopped and
    /// released
    pub fn assert_quiescent(&self) {
        assert_eq!(self.advertiser.tracked_requests().count(), 0);
        assert_eq!(self.advertiser.queued_count(), 0);
        assert!(self
            .advertiser
            .slot_states()
            .iter()
            .all(|state| *state == SlotState::Empty));
        assert!(self.timers.running().is_empty(), "timers still running");
        assert!(
            self.advertisements
                .created()
                .iter()
                .all(FakeAdvertisementProbe::has_been_stopped),
            "advertisement never stopped"
        );
        assert!(
            self.advertisements.alive().is_empty(),
            "advertisement still held"
        );
    }

    /// Structural invariants that hold between public calls
    pub fn assert_invariants(&self) {
        let status = self.advertiser.status();
        let active: Vec<(DeviceIdPair, ConnectionPriority)> = status
            .slots
            .iter()
            .filter_map(|state| match state {
                SlotState::Requested {
                    device_id_pair,
                    priority,
                }
                | SlotState::Advertising {
                    device_id_pair,
                    priority,
                } => Some((device_id_pair.clone(), *priority)),
                SlotState::Empty | SlotState::Stopping { .. } => None,
            })
            .collect();

        let mut seen = HashSet::new();
        for (request, _) in active.iter().chain(status.queued.iter()) {
            assert!(seen.insert(request.clone()), "{request} held twice");
        }

        let tracked: HashSet<DeviceIdPair> =
            self.advertiser.tracked_requests().cloned().collect();
        assert_eq!(seen, tracked, "tracked set differs from slots and queue");

        if !status.queued.is_empty() {
            assert_eq!(
                active.len(),
                self.advertiser.max_concurrent_advertisements(),
                "slot left empty while requests are queued"
            );
        }

        let lowest_active = active.iter().map(|(_, priority)| *priority).min();
        let highest_queued = status.queued.iter().map(|(_, priority)| *priority).max();
        if let (Some(lowest_active), Some(highest_queued)) = (lowest_active, highest_queued) {
            assert!(
                highest_queued <= lowest_active,
                "queued {highest_queued} request outranks active {lowest_active} request"
            );
        }

        assert_eq!(
            self.timers.running().len(),
            active.len(),
            "one rotation timer per assigned slot"
        );

        assert!(
            self.advertisements.alive().len() <= self.advertiser.max_concurrent_advertisements(),
            "more advertisements held than slots"
        );
    }
}
