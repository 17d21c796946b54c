//! Outward notifications raised when an advertising slot ends

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::DeviceIdPair;

/// Receives slot-ended notifications from the advertiser.
///
/// Called on rotation timeout and on preemption, never on explicit removal.
/// Calls happen only after the advertiser has finished updating its slots.
pub trait Delegate: Send + Sync {
    fn on_advertising_slot_ended(
        &self,
        device_id_pair: &DeviceIdPair,
        replaced_by_higher_priority: bool,
    );
}

/// A single slot-ended notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEnded {
    pub device_id_pair: DeviceIdPair,
    pub replaced_by_higher_priority: bool,
}

// ----------------------------------------------------------------------------
// Channel Delegate
// ----------------------------------------------------------------------------

/// Forwards notifications into an unbounded channel so the receiver handles
/// them on its own scheduling turn
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    sender: mpsc::UnboundedSender<SlotEnded>,
}

impl ChannelDelegate {
    pub fn new(sender: mpsc::UnboundedSender<SlotEnded>) -> Self {
        Self { sender }
    }

    /// Create a delegate together with the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SlotEnded>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl Delegate for ChannelDelegate {
    fn on_advertising_slot_ended(
        &self,
        device_id_pair: &DeviceIdPair,
        replaced_by_higher_priority: bool,
    ) {
        let event = SlotEnded {
            device_id_pair: device_id_pair.clone(),
            replaced_by_higher_priority,
        };
        if self.sender.send(event).is_err() {
            debug!(
                "Slot-ended receiver dropped; discarding notification for {}",
                device_id_pair
            );
        }
    }
}
