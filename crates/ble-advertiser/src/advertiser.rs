//! Slot manager multiplexing advertisement requests onto a fixed slot pool
//!
//! [`BleAdvertiser`] owns `N` advertising slots. Requests wait in a
//! [`SharedResourceScheduler`] until a slot is free; a higher-priority
//! request preempts the lowest-priority active slot, and every slot is
//! rotated out when its timeslot ends so equal-priority requests take turns.
//!
//! Stopping a hardware advertisement is asynchronous. A slot can therefore be
//! assigned to a new request while the previous request's advertisement is
//! still stopping; the new advertisement is only created once the old one
//! reports completion.
//!
//! Timer expiries and stop completions never call back into the manager
//! directly. They are posted as [`SlotEvent`]s on an internal channel and
//! applied by [`BleAdvertiser::handle_slot_event`], either from an async
//! driver (see [`crate::runtime`]) or synchronously via
//! [`BleAdvertiser::process_pending_events`].

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::advertisement::{AdvertisementFactory, ErrorTolerantAdvertisement, ServiceDataProvider};
use crate::config::AdvertiserConfig;
use crate::delegate::{Delegate, SlotEnded};
use crate::scheduler::SharedResourceScheduler;
use crate::timer::{OneShotTimer, TimerFactory};
use crate::types::{ConnectionPriority, DeviceIdPair};

// ----------------------------------------------------------------------------
// Slot Events
// ----------------------------------------------------------------------------

/// Asynchronous completions delivered back to the slot manager.
///
/// `ticket` identifies the slot assignment or advertisement that produced the
/// event; events whose ticket no longer matches the slot are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    /// The rotation timer of a slot assignment expired
    TimeslotEnded { slot: usize, ticket: u64 },
    /// A slot's advertisement finished stopping
    AdvertisementStopped { slot: usize, ticket: u64 },
}

pub type SlotEventReceiver = mpsc::UnboundedReceiver<SlotEvent>;

// ----------------------------------------------------------------------------
// Slot State
// ----------------------------------------------------------------------------

/// Observable state of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    /// No request and no advertisement
    Empty,
    /// Request assigned, advertisement not yet created
    Requested {
        device_id_pair: DeviceIdPair,
        priority: ConnectionPriority,
    },
    /// Request assigned and its advertisement is live
    Advertising {
        device_id_pair: DeviceIdPair,
        priority: ConnectionPriority,
    },
    /// No request; a previous advertisement is still stopping
    Stopping { previous: DeviceIdPair },
}

impl SlotState {
    /// Request occupying the slot, if any
    pub fn device_id_pair(&self) -> Option<&DeviceIdPair> {
        match self {
            Self::Requested { device_id_pair, .. } | Self::Advertising { device_id_pair, .. } => {
                Some(device_id_pair)
            }
            Self::Empty | Self::Stopping { .. } => None,
        }
    }
}

/// Snapshot of the whole manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvertiserStatus {
    pub slots: Vec<SlotState>,
    /// Queued requests in the order they will be assigned
    pub queued: Vec<(DeviceIdPair, ConnectionPriority)>,
}

struct ActiveRequest {
    device_id_pair: DeviceIdPair,
    priority: ConnectionPriority,
    timer: Box<dyn OneShotTimer>,
    ticket: u64,
}

struct ActiveAdvertisement {
    handle: Box<dyn ErrorTolerantAdvertisement>,
    ticket: u64,
}

#[derive(Default)]
struct Slot {
    request: Option<ActiveRequest>,
    advertisement: Option<ActiveAdvertisement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    TimeslotEnded,
    Preempted,
    Removed,
}

// ----------------------------------------------------------------------------
// BLE Advertiser
// ----------------------------------------------------------------------------

/// Schedules advertisement requests onto a fixed number of slots
pub struct BleAdvertiser {
    timeslot_duration: Duration,
    service_data_provider: Box<dyn ServiceDataProvider>,
    advertisement_factory: Box<dyn AdvertisementFactory>,
    timer_factory: Box<dyn TimerFactory>,
    delegate: Box<dyn Delegate>,

    scheduler: SharedResourceScheduler,
    all_requests: HashSet<DeviceIdPair>,
    slots: Vec<Slot>,

    next_ticket: u64,
    event_sender: mpsc::UnboundedSender<SlotEvent>,
    event_receiver: Option<SlotEventReceiver>,
    pending_notifications: Vec<SlotEnded>,
}

impl BleAdvertiser {
    /// Create an advertiser with `config.max_concurrent_advertisements` slots.
    ///
    /// # Panics
    /// If the configuration has zero slots.
    pub fn new(
        config: &AdvertiserConfig,
        service_data_provider: Box<dyn ServiceDataProvider>,
        advertisement_factory: Box<dyn AdvertisementFactory>,
        timer_factory: Box<dyn TimerFactory>,
        delegate: Box<dyn Delegate>,
    ) -> Self {
        assert!(
            config.max_concurrent_advertisements > 0,
            "advertiser requires at least one slot"
        );

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let slots = (0..config.max_concurrent_advertisements)
            .map(|_| Slot::default())
            .collect();

        Self {
            timeslot_duration: config.timeslot_duration(),
            service_data_provider,
            advertisement_factory,
            timer_factory,
            delegate,
            scheduler: SharedResourceScheduler::new(),
            all_requests: HashSet::new(),
            slots,
            next_ticket: 0,
            event_sender,
            event_receiver: Some(event_receiver),
            pending_notifications: Vec::new(),
        }
    }

    /// Start tracking `request`.
    ///
    /// # Panics
    /// If `request` is already tracked.
    pub fn add_advertisement_request(
        &mut self,
        request: DeviceIdPair,
        priority: ConnectionPriority,
    ) {
        if self.all_requests.contains(&request) {
            error!(
                "Tried to add advertisement request which was already present. Request: {}, \
                 priority: {}",
                request, priority
            );
            panic!("advertisement request already present: {request}");
        }
        info!("Adding advertisement request {} ({})", request, priority);

        self.all_requests.insert(request.clone());
        self.scheduler.schedule_request(request, priority);

        // An active request with a lower priority gives up its slot.
        self.replace_low_priority_advertisement_if_possible(priority);
        self.settle();
    }

    /// Change the priority of a tracked request.
    ///
    /// # Panics
    /// If `request` is not tracked.
    pub fn update_advertisement_request_priority(
        &mut self,
        request: &DeviceIdPair,
        priority: ConnectionPriority,
    ) {
        if !self.all_requests.contains(request) {
            error!(
                "Tried to update request priority for a request which was not present. \
                 Request: {}, priority: {}",
                request, priority
            );
            panic!("advertisement request not present: {request}");
        }
        debug!("Updating priority of {} to {}", request, priority);

        match self.active_slot_of(request) {
            None => {
                self.scheduler.update_request_priority(request, priority);
                self.replace_low_priority_advertisement_if_possible(priority);
            }
            Some(index) => {
                let still_highest = self
                    .scheduler
                    .get_highest_priority_of_scheduled_requests()
                    .map_or(true, |highest| priority >= highest);

                if let Some(active) = self.slots[index].request.as_mut() {
                    active.priority = priority;
                }

                // Demoted below a queued request: give the slot up.
                if !still_highest {
                    self.end_slot(index, EndReason::Preempted);
                }
            }
        }

        self.settle();
    }

    /// Stop tracking `request`. The delegate is not notified.
    ///
    /// # Panics
    /// If `request` is not tracked.
    pub fn remove_advertisement_request(&mut self, request: &DeviceIdPair) {
        if !self.all_requests.remove(request) {
            error!(
                "Tried to remove an advertisement request which was not present. Request: {}",
                request
            );
            panic!("advertisement request not present: {request}");
        }
        info!("Removing advertisement request {}", request);

        match self.active_slot_of(request) {
            None => self.scheduler.remove_scheduled_request(request),
            Some(index) => self.end_slot(index, EndReason::Removed),
        }

        self.settle();
    }

    /// Apply one asynchronous completion
    pub fn handle_slot_event(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::TimeslotEnded { slot, ticket } => {
                let current = self
                    .slots
                    .get(slot)
                    .and_then(|s| s.request.as_ref())
                    .map(|active| active.ticket);
                if current != Some(ticket) {
                    debug!("Ignoring stale timeslot expiry for slot {}", slot);
                    return;
                }
                self.end_slot(slot, EndReason::TimeslotEnded);
            }
            SlotEvent::AdvertisementStopped { slot, ticket } => {
                let current = self
                    .slots
                    .get(slot)
                    .and_then(|s| s.advertisement.as_ref())
                    .map(|advertisement| advertisement.ticket);
                if current != Some(ticket) {
                    debug!("Ignoring stale stop completion for slot {}", slot);
                    return;
                }
                if let Some(stopped) = self.slots[slot].advertisement.take() {
                    debug!(
                        "Advertisement for {} stopped; slot {} is free for a new advertisement",
                        stopped.handle.device_id_pair(),
                        slot
                    );
                }
            }
        }

        self.settle();
    }

    /// Hand the slot-event receiver to an async driver.
    ///
    /// After this, [`Self::process_pending_events`] is a no-op.
    pub fn take_slot_event_receiver(&mut self) -> Option<SlotEventReceiver> {
        self.event_receiver.take()
    }

    /// Apply every queued slot event, including ones raised while applying.
    /// Returns the number of events applied.
    pub fn process_pending_events(&mut self) -> usize {
        let Some(mut receiver) = self.event_receiver.take() else {
            return 0;
        };

        let mut processed = 0;
        while let Ok(event) = receiver.try_recv() {
            self.handle_slot_event(event);
            processed += 1;
        }

        self.event_receiver = Some(receiver);
        processed
    }

    /// Stop every advertisement and forget all requests without notifying the
    /// delegate
    pub fn stop_all(&mut self) {
        info!(
            "Stopping all advertisements ({} tracked requests)",
            self.all_requests.len()
        );

        for index in 0..self.slots.len() {
            self.stop_active_advertisement(index);
            if let Some(mut active) = self.slots[index].request.take() {
                active.timer.stop();
            }
        }

        self.scheduler = SharedResourceScheduler::new();
        self.all_requests.clear();
        self.pending_notifications.clear();
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn max_concurrent_advertisements(&self) -> usize {
        self.slots.len()
    }

    pub fn timeslot_duration(&self) -> Duration {
        self.timeslot_duration
    }

    /// Whether `request` is known, queued or active
    pub fn is_tracked(&self, request: &DeviceIdPair) -> bool {
        self.all_requests.contains(request)
    }

    pub fn tracked_requests(&self) -> impl Iterator<Item = &DeviceIdPair> {
        self.all_requests.iter()
    }

    /// Index of the slot `request` is assigned to
    pub fn active_slot_of(&self, request: &DeviceIdPair) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.request
                .as_ref()
                .is_some_and(|active| &active.device_id_pair == request)
        })
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.request.is_some()).count()
    }

    pub fn queued_count(&self) -> usize {
        self.scheduler.len()
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(Self::slot_state).collect()
    }

    pub fn status(&self) -> AdvertiserStatus {
        AdvertiserStatus {
            slots: self.slot_states(),
            queued: self
                .scheduler
                .iter()
                .map(|(request, priority)| (request.clone(), priority))
                .collect(),
        }
    }

    fn slot_state(slot: &Slot) -> SlotState {
        match (&slot.request, &slot.advertisement) {
            (None, None) => SlotState::Empty,
            (None, Some(advertisement)) => SlotState::Stopping {
                previous: advertisement.handle.device_id_pair().clone(),
            },
            (Some(active), advertisement) => {
                let live = advertisement.as_ref().is_some_and(|advertisement| {
                    !advertisement.handle.has_been_stopped()
                        && advertisement.handle.device_id_pair() == &active.device_id_pair
                });
                if live {
                    SlotState::Advertising {
                        device_id_pair: active.device_id_pair.clone(),
                        priority: active.priority,
                    }
                } else {
                    SlotState::Requested {
                        device_id_pair: active.device_id_pair.clone(),
                        priority: active.priority,
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Slot Transitions
    // ------------------------------------------------------------------------

    /// Preempt the lowest-priority active slot if it is below `priority`.
    fn replace_low_priority_advertisement_if_possible(
        &mut self,
        priority: ConnectionPriority,
    ) -> bool {
        match self.index_with_lower_priority(priority) {
            Some(index) => {
                self.end_slot(index, EndReason::Preempted);
                true
            }
            None => false,
        }
    }

    /// First slot holding the strictly lowest priority, if that priority is
    /// below `priority`. High-priority slots are never candidates.
    fn index_with_lower_priority(&self, priority: ConnectionPriority) -> Option<usize> {
        let mut lowest_priority = ConnectionPriority::High;
        let mut index_with_lowest_priority = None;

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(active) = &slot.request else {
                continue;
            };
            if active.priority < lowest_priority {
                lowest_priority = active.priority;
                index_with_lowest_priority = Some(index);
            }
        }

        index_with_lowest_priority.filter(|_| lowest_priority < priority)
    }

    /// Release slot `index`, stopping its advertisement. Timeouts and
    /// preemptions reschedule the request and notify the delegate; removals
    /// do neither.
    fn end_slot(&mut self, index: usize, reason: EndReason) {
        self.stop_active_advertisement(index);

        let Some(mut active) = self.slots[index].request.take() else {
            return;
        };
        active.timer.stop();
        debug!(
            "Slot {} released by {} ({:?})",
            index, active.device_id_pair, reason
        );

        if reason == EndReason::Removed {
            return;
        }

        self.scheduler
            .schedule_request(active.device_id_pair.clone(), active.priority);
        self.pending_notifications.push(SlotEnded {
            device_id_pair: active.device_id_pair,
            replaced_by_higher_priority: reason == EndReason::Preempted,
        });
    }

    fn stop_active_advertisement(&mut self, index: usize) {
        let Some(advertisement) = self.slots[index].advertisement.as_mut() else {
            return;
        };

        // Already stopping; the pending completion frees the slot.
        if advertisement.handle.has_been_stopped() {
            return;
        }

        let sender = self.event_sender.clone();
        let ticket = advertisement.ticket;
        advertisement.handle.stop(Box::new(move || {
            let _ = sender.send(SlotEvent::AdvertisementStopped {
                slot: index,
                ticket,
            });
        }));
    }

    /// Fill free slots from the scheduler and create advertisements for
    /// assigned slots, until nothing changes; then deliver notifications.
    fn settle(&mut self) {
        while self.update_advertisement_state() {}
        self.flush_notifications();
    }

    fn update_advertisement_state(&mut self) -> bool {
        let mut progressed = false;

        for index in 0..self.slots.len() {
            if self.slots[index].request.is_none() && !self.scheduler.is_empty() {
                self.add_active_advertisement_request(index);
                progressed = true;
            }

            if self.slots[index].request.is_some() && self.slots[index].advertisement.is_none() {
                self.add_active_advertisement(index);
                progressed = true;
            }
        }

        progressed
    }

    fn add_active_advertisement_request(&mut self, index: usize) {
        let Some((device_id_pair, priority)) = self.scheduler.get_next_scheduled_request() else {
            return;
        };

        let ticket = self.allocate_ticket();
        let sender = self.event_sender.clone();
        let mut timer = self.timer_factory.create_one_shot_timer();
        timer.start(
            self.timeslot_duration,
            Box::new(move || {
                let _ = sender.send(SlotEvent::TimeslotEnded {
                    slot: index,
                    ticket,
                });
            }),
        );

        debug!(
            "Slot {} assigned to {} ({})",
            index, device_id_pair, priority
        );
        self.slots[index].request = Some(ActiveRequest {
            device_id_pair,
            priority,
            timer,
            ticket,
        });
    }

    fn add_active_advertisement(&mut self, index: usize) {
        let Some(active) = &self.slots[index].request else {
            return;
        };
        let device_id_pair = active.device_id_pair.clone();

        let service_data = self
            .service_data_provider
            .generate_foreground_advertisement(&device_id_pair);
        let handle = self
            .advertisement_factory
            .create(&device_id_pair, service_data);

        debug!("Slot {} advertising {}", index, device_id_pair);
        let ticket = self.allocate_ticket();
        self.slots[index].advertisement = Some(ActiveAdvertisement { handle, ticket });
    }

    fn flush_notifications(&mut self) {
        for ended in std::mem::take(&mut self.pending_notifications) {
            debug!(
                "Advertising slot ended for {} (replaced by higher priority: {})",
                ended.device_id_pair, ended.replaced_by_higher_priority
            );
            self.delegate
                .on_advertising_slot_ended(&ended.device_id_pair, ended.replaced_by_higher_priority);
        }
    }

    fn allocate_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}
