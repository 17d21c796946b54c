//! Value types identifying advertisement requests and their importance

use core::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Device ID Pair
// ----------------------------------------------------------------------------

/// Identifies one "this local device wants to reach that remote device" request.
///
/// Ordering is lexicographic on the remote ID first, then the local ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdPair {
    remote_device_id: String,
    local_device_id: String,
}

impl DeviceIdPair {
    /// Create a new pair from the remote and local device IDs
    pub fn new(remote_device_id: impl Into<String>, local_device_id: impl Into<String>) -> Self {
        Self {
            remote_device_id: remote_device_id.into(),
            local_device_id: local_device_id.into(),
        }
    }

    pub fn remote_device_id(&self) -> &str {
        &self.remote_device_id
    }

    pub fn local_device_id(&self) -> &str {
        &self.local_device_id
    }
}

impl fmt::Display for DeviceIdPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote={}, local={}",
            self.remote_device_id, self.local_device_id
        )
    }
}

// ----------------------------------------------------------------------------
// Connection Priority
// ----------------------------------------------------------------------------

/// Importance of a request; `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPriority {
    Low,
    Medium,
    High,
}

impl ConnectionPriority {
    /// Every priority, highest first
    pub const ALL: [ConnectionPriority; 3] = [Self::High, Self::Medium, Self::Low];

    /// Position of this priority in a per-priority table (0 = low)
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }
}

impl fmt::Display for ConnectionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(name)
    }
}
