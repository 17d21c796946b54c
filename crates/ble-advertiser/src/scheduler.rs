//! Priority queue over pending advertisement requests
//!
//! [`SharedResourceScheduler`] tracks requests that are waiting for a shared
//! resource. Requests come out highest priority first and FIFO within a
//! priority. It has no notion of slots, timers or hardware.

use std::collections::{HashMap, VecDeque};

use tracing::{error, warn};

use crate::types::{ConnectionPriority, DeviceIdPair};

// ----------------------------------------------------------------------------
// Shared Resource Scheduler
// ----------------------------------------------------------------------------

/// Pending requests, one FIFO queue per priority level.
///
/// A request is in queue `P` if and only if `priorities` maps it to `P`.
#[derive(Debug, Default)]
pub struct SharedResourceScheduler {
    queues: [VecDeque<DeviceIdPair>; 3],
    priorities: HashMap<DeviceIdPair, ConnectionPriority>,
}

impl SharedResourceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `request` to the tail of the queue for `priority`.
    ///
    /// # Panics
    /// If `request` is already scheduled.
    pub fn schedule_request(&mut self, request: DeviceIdPair, priority: ConnectionPriority) {
        if let Some(existing) = self.priorities.get(&request) {
            error!(
                "Tried to schedule a request which was already scheduled. Request: {}, \
                 existing priority: {}, new priority: {}",
                request, existing, priority
            );
            panic!("request already scheduled: {request}");
        }

        self.queues[priority.index()].push_back(request.clone());
        self.priorities.insert(request, priority);
    }

    /// Move `request` to the tail of the queue for `new_priority`.
    ///
    /// The request loses its FIFO position. Updating to the current priority
    /// is a no-op.
    ///
    /// # Panics
    /// If `request` is not scheduled.
    pub fn update_request_priority(
        &mut self,
        request: &DeviceIdPair,
        new_priority: ConnectionPriority,
    ) {
        let Some(&current) = self.priorities.get(request) else {
            error!(
                "Tried to update priority of a request which was not scheduled. Request: {}, \
                 priority: {}",
                request, new_priority
            );
            panic!("request not scheduled: {request}");
        };

        if current == new_priority {
            warn!(
                "Tried to update request priority to the priority it already has. Request: {}, \
                 priority: {}",
                request, current
            );
            return;
        }

        self.remove_from_queue(request, current);
        self.queues[new_priority.index()].push_back(request.clone());
        self.priorities.insert(request.clone(), new_priority);
    }

    /// Forget `request` entirely.
    ///
    /// # Panics
    /// If `request` is not scheduled.
    pub fn remove_scheduled_request(&mut self, request: &DeviceIdPair) {
        let Some(priority) = self.priorities.remove(request) else {
            error!(
                "Tried to remove a request which was not scheduled. Request: {}",
                request
            );
            panic!("request not scheduled: {request}");
        };

        self.remove_from_queue(request, priority);
    }

    /// Pop the oldest request of the highest non-empty priority.
    pub fn get_next_scheduled_request(&mut self) -> Option<(DeviceIdPair, ConnectionPriority)> {
        let priority = self.get_highest_priority_of_scheduled_requests()?;
        let request = self.queues[priority.index()].pop_front()?;
        self.priorities.remove(&request);
        Some((request, priority))
    }

    /// Priority of the request [`Self::get_next_scheduled_request`] would return.
    pub fn get_highest_priority_of_scheduled_requests(&self) -> Option<ConnectionPriority> {
        ConnectionPriority::ALL
            .into_iter()
            .find(|priority| !self.queues[priority.index()].is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.priorities.len()
    }

    /// Current priority of a scheduled request
    pub fn priority_of(&self, request: &DeviceIdPair) -> Option<ConnectionPriority> {
        self.priorities.get(request).copied()
    }

    pub fn contains(&self, request: &DeviceIdPair) -> bool {
        self.priorities.contains_key(request)
    }

    /// Scheduled requests in the order they would be popped
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceIdPair, ConnectionPriority)> + '_ {
        ConnectionPriority::ALL.into_iter().flat_map(move |priority| {
            self.queues[priority.index()]
                .iter()
                .map(move |request| (request, priority))
        })
    }

    fn remove_from_queue(&mut self, request: &DeviceIdPair, priority: ConnectionPriority) {
        let queue = &mut self.queues[priority.index()];
        if let Some(position) = queue.iter().position(|queued| queued == request) {
            queue.remove(position);
        }
    }
}
