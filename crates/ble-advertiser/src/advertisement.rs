//! Collaborator contracts for creating and tearing down hardware advertisements

use core::fmt;

use crate::types::DeviceIdPair;

/// Invoked exactly once when a stopped advertisement has been torn down
pub type StopCallback = Box<dyn FnOnce() + Send + 'static>;

// ----------------------------------------------------------------------------
// Advertisement Payload
// ----------------------------------------------------------------------------

/// Bytes to advertise for one request, with the window they are valid for
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub data: Vec<u8>,
    pub start_timestamp_ms: i64,
    pub end_timestamp_ms: i64,
}

impl ServiceData {
    pub fn new(data: Vec<u8>, start_timestamp_ms: i64, end_timestamp_ms: i64) -> Self {
        Self {
            data,
            start_timestamp_ms,
            end_timestamp_ms,
        }
    }

    /// Whether `timestamp_ms` falls inside the validity window
    pub fn is_valid_at(&self, timestamp_ms: i64) -> bool {
        self.start_timestamp_ms <= timestamp_ms && timestamp_ms < self.end_timestamp_ms
    }
}

impl fmt::Debug for ServiceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceData")
            .field("data", &hex::encode(&self.data))
            .field("start_timestamp_ms", &self.start_timestamp_ms)
            .field("end_timestamp_ms", &self.end_timestamp_ms)
            .finish()
    }
}

/// Produces the payload to advertise for a request
pub trait ServiceDataProvider: Send {
    fn generate_foreground_advertisement(&self, device_id_pair: &DeviceIdPair) -> ServiceData;
}

// ----------------------------------------------------------------------------
// Advertisement Handles
// ----------------------------------------------------------------------------

/// One in-flight hardware advertisement.
///
/// Transient register/unregister failures are retried internally and never
/// surface to the caller.
pub trait ErrorTolerantAdvertisement: Send {
    /// The request this advertisement was created for
    fn device_id_pair(&self) -> &DeviceIdPair;

    /// Tear down the advertisement. Calls after the first are ignored.
    fn stop(&mut self, on_stopped: StopCallback);

    /// Whether [`Self::stop`] has already been requested
    fn has_been_stopped(&self) -> bool;
}

/// Creates advertisement handles; owns whatever serializes hardware access
pub trait AdvertisementFactory: Send {
    fn create(
        &self,
        device_id_pair: &DeviceIdPair,
        service_data: ServiceData,
    ) -> Box<dyn ErrorTolerantAdvertisement>;
}
