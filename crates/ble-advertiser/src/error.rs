//! Error types for the advertiser
//!
//! Contract violations (adding a tracked request, updating or removing an
//! untracked one) are programmer errors and panic. The types here cover the
//! recoverable boundaries: the async task wrapper, configuration and the
//! hardware backend behind the retrying advertisement.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by the advertiser's public async and configuration APIs
#[derive(Error, Debug)]
pub enum AdvertiserError {
    #[error("Advertiser task is no longer running")]
    TaskStopped,

    #[error("Advertiser task panicked: {0}")]
    TaskPanicked(String),

    #[error("Slot event receiver was already taken from this advertiser")]
    EventReceiverTaken,

    #[error("Invalid advertiser configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

/// Failures reported by an [`AdvertisementBackend`](crate::AdvertisementBackend).
///
/// These are retried by [`RetryingAdvertisement`](crate::RetryingAdvertisement)
/// and never reach the slot manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to register advertisement: {0}")]
    RegistrationFailed(String),

    #[error("Failed to unregister advertisement: {0}")]
    UnregistrationFailed(String),

    #[error("BLE adapter not available")]
    AdapterUnavailable,
}

/// Result type for advertiser operations
pub type Result<T> = std::result::Result<T, AdvertiserError>;
