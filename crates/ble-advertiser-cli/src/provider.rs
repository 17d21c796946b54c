//! Rotating advertisement payloads
//!
//! Each request advertises a short hash of its device IDs and the current
//! rotation period, so the payload changes every period and cannot be linked
//! across periods without knowing the IDs.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use ble_advertiser::{DeviceIdPair, ServiceData, ServiceDataProvider};

/// Default length of one payload rotation period
pub const DEFAULT_ROTATION_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Bytes of the hash placed in the advertisement
pub const PAYLOAD_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct RotatingServiceDataProvider {
    period_ms: i64,
}

impl RotatingServiceDataProvider {
    pub fn new(period: Duration) -> Self {
        Self {
            period_ms: (period.as_millis() as i64).max(1),
        }
    }

    /// Payload for `device_id_pair` in the period containing `now_ms`
    pub fn service_data_at(&self, device_id_pair: &DeviceIdPair, now_ms: i64) -> ServiceData {
        let period_index = now_ms.div_euclid(self.period_ms);

        let mut hasher = Sha256::new();
        hasher.update(device_id_pair.remote_device_id().as_bytes());
        hasher.update([0u8]);
        hasher.update(device_id_pair.local_device_id().as_bytes());
        hasher.update(period_index.to_be_bytes());
        let digest = hasher.finalize();

        let start_timestamp_ms = period_index * self.period_ms;
        ServiceData::new(
            digest[..PAYLOAD_LEN].to_vec(),
            start_timestamp_ms,
            start_timestamp_ms + self.period_ms,
        )
    }
}

impl Default for RotatingServiceDataProvider {
    fn default() -> Self {
        Self::new(DEFAULT_ROTATION_PERIOD)
    }
}

impl ServiceDataProvider for RotatingServiceDataProvider {
    fn generate_foreground_advertisement(&self, device_id_pair: &DeviceIdPair) -> ServiceData {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        self.service_data_at(device_id_pair, now_ms)
    }
}
