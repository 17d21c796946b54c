//! Async actor that owns a [`BleAdvertiser`]
//!
//! The advertiser itself is single-threaded. [`AdvertiserTask`] gives it a
//! home on a tokio task: commands arrive over a bounded `mpsc` channel,
//! timer expiries and stop completions over the advertiser's own slot-event
//! channel, and both are applied one at a time in a `select!` loop.
//! [`AdvertiserHandle`] is the cloneable front door.

use std::any::Any;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::advertisement::{AdvertisementFactory, ServiceDataProvider};
use crate::advertiser::{AdvertiserStatus, BleAdvertiser, SlotEventReceiver, SlotState};
use crate::config::AdvertiserConfig;
use crate::delegate::Delegate;
use crate::error::{AdvertiserError, Result};
use crate::timer::TimerFactory;
use crate::types::{ConnectionPriority, DeviceIdPair};

/// Commands buffered before callers start waiting on the task
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// How long shutdown waits for in-flight advertisements to finish stopping
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum AdvertiserCommand {
    Add {
        request: DeviceIdPair,
        priority: ConnectionPriority,
        reply: oneshot::Sender<()>,
    },
    UpdatePriority {
        request: DeviceIdPair,
        priority: ConnectionPriority,
        reply: oneshot::Sender<()>,
    },
    Remove {
        request: DeviceIdPair,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<AdvertiserStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ----------------------------------------------------------------------------
// Advertiser Task
// ----------------------------------------------------------------------------

/// Drives a [`BleAdvertiser`] from commands and slot events
pub struct AdvertiserTask {
    advertiser: BleAdvertiser,
    command_receiver: mpsc::Receiver<AdvertiserCommand>,
    slot_events: SlotEventReceiver,
}

impl AdvertiserTask {
    /// Wrap `advertiser`, returning the task and a handle to it.
    ///
    /// Fails if the advertiser's slot-event receiver was already taken.
    pub fn new(mut advertiser: BleAdvertiser) -> Result<(Self, AdvertiserHandle)> {
        let slot_events = advertiser
            .take_slot_event_receiver()
            .ok_or(AdvertiserError::EventReceiverTaken)?;
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let task = Self {
            advertiser,
            command_receiver,
            slot_events,
        };
        Ok((task, AdvertiserHandle { command_sender }))
    }

    /// Run until shutdown is requested or every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Advertiser task starting with {} slots",
            self.advertiser.max_concurrent_advertisements()
        );

        loop {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(AdvertiserCommand::Shutdown { reply }) => {
                            self.shut_down().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            info!("Command channel closed, shutting down");
                            self.shut_down().await;
                            break;
                        }
                    }
                }

                Some(event) = self.slot_events.recv() => {
                    self.advertiser.handle_slot_event(event);
                }
            }
        }

        info!("Advertiser task stopped");
    }

    fn handle_command(&mut self, command: AdvertiserCommand) {
        debug!("Advertiser task received {:?}", command);

        match command {
            AdvertiserCommand::Add {
                request,
                priority,
                reply,
            } => {
                self.advertiser.add_advertisement_request(request, priority);
                let _ = reply.send(());
            }
            AdvertiserCommand::UpdatePriority {
                request,
                priority,
                reply,
            } => {
                self.advertiser
                    .update_advertisement_request_priority(&request, priority);
                let _ = reply.send(());
            }
            AdvertiserCommand::Remove { request, reply } => {
                self.advertiser.remove_advertisement_request(&request);
                let _ = reply.send(());
            }
            AdvertiserCommand::Status { reply } => {
                let _ = reply.send(self.advertiser.status());
            }
            AdvertiserCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Stop everything, then wait (bounded) for the stops to complete
    async fn shut_down(&mut self) {
        self.advertiser.stop_all();

        let drain = async {
            while self.holds_advertisements() {
                match self.slot_events.recv().await {
                    Some(event) => self.advertiser.handle_slot_event(event),
                    None => break,
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, drain).await.is_err() {
            warn!(
                "Advertisements still stopping after {:?}; abandoning them",
                SHUTDOWN_GRACE_PERIOD
            );
        }
    }

    fn holds_advertisements(&self) -> bool {
        self.advertiser
            .slot_states()
            .iter()
            .any(|state| *state != SlotState::Empty)
    }
}

// ----------------------------------------------------------------------------
// Advertiser Handle
// ----------------------------------------------------------------------------

/// Cloneable handle for talking to a running [`AdvertiserTask`].
///
/// Contract violations (adding a tracked request, updating or removing an
/// untracked one) panic inside the task. The call that caused it, and every
/// call after, returns [`AdvertiserError::TaskStopped`].
#[derive(Debug, Clone)]
pub struct AdvertiserHandle {
    command_sender: mpsc::Sender<AdvertiserCommand>,
}

impl AdvertiserHandle {
    pub async fn add_advertisement_request(
        &self,
        request: DeviceIdPair,
        priority: ConnectionPriority,
    ) -> Result<()> {
        self.call(|reply| AdvertiserCommand::Add {
            request,
            priority,
            reply,
        })
        .await
    }

    pub async fn update_advertisement_request_priority(
        &self,
        request: DeviceIdPair,
        priority: ConnectionPriority,
    ) -> Result<()> {
        self.call(|reply| AdvertiserCommand::UpdatePriority {
            request,
            priority,
            reply,
        })
        .await
    }

    pub async fn remove_advertisement_request(&self, request: DeviceIdPair) -> Result<()> {
        self.call(|reply| AdvertiserCommand::Remove { request, reply })
            .await
    }

    pub async fn status(&self) -> Result<AdvertiserStatus> {
        self.call(|reply| AdvertiserCommand::Status { reply }).await
    }

    /// Stop all advertisements and end the task
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| AdvertiserCommand::Shutdown { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.command_sender.is_closed()
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> AdvertiserCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command_sender
            .send(command(reply))
            .await
            .map_err(|_| AdvertiserError::TaskStopped)?;
        response.await.map_err(|_| AdvertiserError::TaskStopped)
    }
}

// ----------------------------------------------------------------------------
// Spawning
// ----------------------------------------------------------------------------

/// Join handle for a spawned [`AdvertiserTask`]
#[derive(Debug)]
pub struct AdvertiserJoinHandle {
    inner: JoinHandle<()>,
}

impl AdvertiserJoinHandle {
    /// Wait for the task to end, surfacing a panic as
    /// [`AdvertiserError::TaskPanicked`]
    pub async fn join(self) -> Result<()> {
        match self.inner.await {
            Ok(()) => Ok(()),
            Err(error) if error.is_panic() => Err(AdvertiserError::TaskPanicked(
                panic_message(error.into_panic()),
            )),
            Err(_) => Err(AdvertiserError::TaskStopped),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn abort(&self) {
        self.inner.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Validate `config`, build an advertiser and spawn its task.
///
/// Must be called from inside a tokio runtime.
pub fn spawn_advertiser(
    config: &AdvertiserConfig,
    service_data_provider: Box<dyn ServiceDataProvider>,
    advertisement_factory: Box<dyn AdvertisementFactory>,
    timer_factory: Box<dyn TimerFactory>,
    delegate: Box<dyn Delegate>,
) -> Result<(AdvertiserHandle, AdvertiserJoinHandle)> {
    config.validate()?;

    let advertiser = BleAdvertiser::new(
        config,
        service_data_provider,
        advertisement_factory,
        timer_factory,
        delegate,
    );
    let (task, handle) = AdvertiserTask::new(advertiser)?;
    let inner = tokio::spawn(task.run());

    Ok((handle, AdvertiserJoinHandle { inner }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeAdvertisementFactory, FakeServiceDataProvider, FakeTimerFactory, RecordingDelegate,
    };
    use tokio_test::{assert_err, assert_ok};

    fn pair(n: u32) -> DeviceIdPair {
        DeviceIdPair::new(format!("remote{n}"), format!("local{n}"))
    }

    struct Harness {
        handle: AdvertiserHandle,
        join: AdvertiserJoinHandle,
        advertisements: FakeAdvertisementFactory,
        timers: FakeTimerFactory,
        delegate: RecordingDelegate,
    }

    fn spawn_with_fakes(slots: usize) -> Harness {
        let advertisements = FakeAdvertisementFactory::new();
        let timers = FakeTimerFactory::new();
        let delegate = RecordingDelegate::new();
        let config = AdvertiserConfig::new().with_max_concurrent_advertisements(slots);

        let (handle, join) = spawn_advertiser(
            &config,
            Box::new(FakeServiceDataProvider),
            Box::new(advertisements.clone()),
            Box::new(timers.clone()),
            Box::new(delegate.clone()),
        )
        .unwrap();

        Harness {
            handle,
            join,
            advertisements,
            timers,
            delegate,
        }
    }

    #[tokio::test]
    async fn test_commands_round_trip() {
        let harness = spawn_with_fakes(1);

        assert_ok!(
            harness
                .handle
                .add_advertisement_request(pair(1), ConnectionPriority::Low)
                .await
        );
        assert_ok!(
            harness
                .handle
                .add_advertisement_request(pair(2), ConnectionPriority::Low)
                .await
        );

        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.slots[0].device_id_pair(), Some(&pair(1)));
        assert_eq!(status.queued, vec![(pair(2), ConnectionPriority::Low)]);

        assert_ok!(
            harness
                .handle
                .update_advertisement_request_priority(pair(2), ConnectionPriority::High)
                .await
        );
        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.slots[0].device_id_pair(), Some(&pair(2)));
        assert_eq!(harness.delegate.ended_advertisements().len(), 1);

        assert_ok!(harness.handle.remove_advertisement_request(pair(1)).await);
        let status = harness.handle.status().await.unwrap();
        assert!(status.queued.is_empty());
    }

    #[tokio::test]
    async fn test_slot_events_reach_the_task() {
        let harness = spawn_with_fakes(1);
        harness
            .handle
            .add_advertisement_request(pair(1), ConnectionPriority::Low)
            .await
            .unwrap();
        let advertisement = harness.advertisements.last().unwrap();

        assert!(harness.timers.last().unwrap().fire());
        while harness.delegate.ended_advertisements().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(advertisement.has_been_stopped());

        assert!(advertisement.invoke_stop_callback());
        while harness.advertisements.num_instances_created() < 2 {
            tokio::task::yield_now().await;
        }
        let status = harness.handle.status().await.unwrap();
        assert!(matches!(status.slots[0], SlotState::Advertising { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_stops_advertisements() {
        let harness = spawn_with_fakes(2);
        harness
            .handle
            .add_advertisement_request(pair(1), ConnectionPriority::Medium)
            .await
            .unwrap();
        let advertisement = harness.advertisements.last().unwrap();

        let handle = harness.handle.clone();
        let shutdown = tokio::spawn(async move { handle.shutdown().await });

        while !advertisement.has_been_stopped() {
            tokio::task::yield_now().await;
        }
        assert!(advertisement.invoke_stop_callback());

        assert_ok!(shutdown.await.unwrap());
        assert_ok!(harness.join.join().await);
        assert!(harness.delegate.ended_advertisements().is_empty());
        assert_err!(
            harness
                .handle
                .add_advertisement_request(pair(2), ConnectionPriority::Low)
                .await
        );
    }

    #[tokio::test]
    async fn test_contract_violation_surfaces_as_panic() {
        let harness = spawn_with_fakes(1);
        harness
            .handle
            .add_advertisement_request(pair(1), ConnectionPriority::Low)
            .await
            .unwrap();

        let result = harness
            .handle
            .add_advertisement_request(pair(1), ConnectionPriority::Low)
            .await;
        assert!(matches!(result, Err(AdvertiserError::TaskStopped)));

        match harness.join.join().await {
            Err(AdvertiserError::TaskPanicked(message)) => {
                assert!(message.contains("already present"));
            }
            other => panic!("expected a panic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropping_every_handle_ends_task() {
        let harness = spawn_with_fakes(1);
        drop(harness.handle);
        assert_ok!(harness.join.join().await);
    }

    #[test]
    fn test_receiver_can_only_be_taken_once() {
        let mut advertiser = BleAdvertiser::new(
            &AdvertiserConfig::default(),
            Box::new(FakeServiceDataProvider),
            Box::new(FakeAdvertisementFactory::new()),
            Box::new(FakeTimerFactory::new()),
            Box::new(RecordingDelegate::new()),
        );
        assert!(advertiser.take_slot_event_receiver().is_some());
        assert!(matches!(
            AdvertiserTask::new(advertiser),
            Err(AdvertiserError::EventReceiverTaken)
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_spawning() {
        let config = AdvertiserConfig::new().with_max_concurrent_advertisements(0);
        let result = spawn_advertiser(
            &config,
            Box::new(FakeServiceDataProvider),
            Box::new(FakeAdvertisementFactory::new()),
            Box::new(FakeTimerFactory::new()),
            Box::new(RecordingDelegate::new()),
        );
        assert!(matches!(
            result,
            Err(AdvertiserError::InvalidConfiguration { .. })
        ));
    }
}
