//! Priority-aware BLE advertisement slot scheduling
//!
//! A Bluetooth controller can only run a handful of advertisements at once,
//! but a device may want to reach many remote devices. This crate multiplexes
//! advertisement requests onto a fixed pool of slots: higher-priority requests
//! preempt lower-priority ones, and a rotation timer moves requests out of
//! their slot periodically so equal-priority requests take turns.
//!
//! ## Architecture
//!
//! - [`types`] - Request identifiers and priorities
//! - [`scheduler`] - Priority queue of waiting requests
//! - [`advertiser`] - The slot manager, [`BleAdvertiser`]
//! - [`advertisement`] - Contracts for creating and stopping hardware advertisements
//! - [`timer`] - One-shot rotation timers, with a tokio implementation
//! - [`delegate`] - Notifications raised when a slot ends
//! - [`error_tolerant`] - Advertisements that retry hardware failures
//! - [`runtime`] - Async actor wrapping the slot manager
//! - [`config`] - Advertiser configuration
//! - [`error`] - Error types
//! - [`testing`] - In-memory fakes for deterministic tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ble_advertiser::{
//!     spawn_advertiser, AdvertiserConfig, ChannelDelegate, ConnectionPriority, DeviceIdPair,
//!     TokioTimerFactory,
//! };
//! # use ble_advertiser::{AdvertisementFactory, ServiceDataProvider};
//! # async fn example(
//! #     provider: Box<dyn ServiceDataProvider>,
//! #     factory: Box<dyn AdvertisementFactory>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AdvertiserConfig::new().with_max_concurrent_advertisements(2);
//! let (delegate, mut slot_ended) = ChannelDelegate::channel();
//!
//! let (advertiser, _task) = spawn_advertiser(
//!     &config,
//!     provider,
//!     factory,
//!     Box::new(TokioTimerFactory),
//!     Box::new(delegate),
//! )?;
//!
//! advertiser
//!     .add_advertisement_request(DeviceIdPair::new("remote", "local"), ConnectionPriority::High)
//!     .await?;
//!
//! while let Some(ended) = slot_ended.recv().await {
//!     println!("slot ended for {}", ended.device_id_pair);
//! }
//! # Ok(())
//! # }
//! ```

pub mod advertisement;
pub mod advertiser;
pub mod config;
pub mod delegate;
pub mod error;
pub mod error_tolerant;
pub mod runtime;
pub mod scheduler;
pub mod testing;
pub mod timer;
pub mod types;

pub use advertisement::{
    AdvertisementFactory, ErrorTolerantAdvertisement, ServiceData, ServiceDataProvider,
    StopCallback,
};
pub use advertiser::{AdvertiserStatus, BleAdvertiser, SlotEvent, SlotEventReceiver, SlotState};
pub use config::{
    AdvertiserConfig, RetryConfig, DEFAULT_MAX_CONCURRENT_ADVERTISEMENTS,
    DEFAULT_TIMESLOT_DURATION,
};
pub use delegate::{ChannelDelegate, Delegate, SlotEnded};
pub use error::{AdvertiserError, BackendError, Result};
pub use error_tolerant::{
    AdvertisementBackend, BleSynchronizer, RetryingAdvertisement, RetryingAdvertisementFactory,
};
pub use runtime::{spawn_advertiser, AdvertiserHandle, AdvertiserJoinHandle, AdvertiserTask};
pub use scheduler::SharedResourceScheduler;
pub use timer::{OneShotTimer, TimerCallback, TimerFactory, TokioOneShotTimer, TokioTimerFactory};
pub use types::{ConnectionPriority, DeviceIdPair};
