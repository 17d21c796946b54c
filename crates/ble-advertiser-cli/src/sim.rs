//! Scenario execution
//!
//! Spawns the advertiser actor against a [`SimulatedBackend`], replays the
//! scenario timeline and collects every slot-ended notification.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep_until, Instant};
use tracing::info;

use ble_advertiser::{
    spawn_advertiser, AdvertiserHandle, AdvertiserStatus, BleSynchronizer, ChannelDelegate,
    DeviceIdPair, RetryingAdvertisementFactory, SlotEnded, SlotState, TokioTimerFactory,
};

use crate::backend::{BackendStats, SimulatedBackend};
use crate::config::{SimConfig, Step, StepAction};
use crate::error::{CliError, Result};
use crate::provider::RotatingServiceDataProvider;

/// What happened during a run
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Slot-ended notifications, with milliseconds since the run started
    pub slot_ended: Vec<(u64, SlotEnded)>,
    /// Advertiser state just before shutdown
    pub final_status: AdvertiserStatus,
    /// Requests the controller was advertising just before shutdown
    pub advertising_at_end: Vec<DeviceIdPair>,
    /// Requests still advertised after shutdown; empty on a clean run
    pub leaked: Vec<DeviceIdPair>,
    pub backend: BackendStats,
}

/// Run `config` to completion
pub async fn run(config: &SimConfig) -> Result<SimReport> {
    config.validate()?;

    let backend = Arc::new(SimulatedBackend::new(&config.backend));
    let factory = RetryingAdvertisementFactory::with_synchronizer(
        Arc::clone(&backend),
        Arc::new(BleSynchronizer::new(config.advertiser.min_command_interval())),
        config.advertiser.retry.clone(),
    );
    let (delegate, mut slot_ended) = ChannelDelegate::channel();

    let (handle, join) = spawn_advertiser(
        &config.advertiser,
        Box::new(RotatingServiceDataProvider::default()),
        Box::new(factory),
        Box::new(TokioTimerFactory),
        Box::new(delegate),
    )?;

    let start = Instant::now();
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(ended) = slot_ended.recv().await {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            info!(
                "[{:>6}ms] Slot ended for {} ({})",
                elapsed_ms,
                ended.device_id_pair,
                if ended.replaced_by_higher_priority {
                    "preempted"
                } else {
                    "timeslot over"
                }
            );
            events.push((elapsed_ms, ended));
        }
        events
    });

    info!(
        "Running scenario: {} steps over {}ms",
        config.steps.len(),
        config.run_for_ms
    );
    for step in &config.steps {
        sleep_until(start + Duration::from_millis(step.at_ms)).await;
        apply_step(&handle, step).await?;
    }
    sleep_until(start + config.run_for()).await;

    let final_status = handle.status().await?;
    let advertising_at_end = backend.active();

    handle.shutdown().await?;
    join.join().await?;
    drop(handle);

    let slot_ended = collector
        .await
        .map_err(|error| CliError::Simulation(format!("event collector failed: {error}")))?;

    Ok(SimReport {
        slot_ended,
        final_status,
        advertising_at_end,
        leaked: backend.active(),
        backend: backend.stats(),
    })
}

async fn apply_step(handle: &AdvertiserHandle, step: &Step) -> Result<()> {
    info!("[{:>6}ms] {:?}", step.at_ms, step.action);

    match &step.action {
        StepAction::Add {
            remote,
            local,
            priority,
        } => {
            handle
                .add_advertisement_request(DeviceIdPair::new(remote, local), *priority)
                .await?
        }
        StepAction::Update {
            remote,
            local,
            priority,
        } => {
            handle
                .update_advertisement_request_priority(DeviceIdPair::new(remote, local), *priority)
                .await?
        }
        StepAction::Remove { remote, local } => {
            handle
                .remove_advertisement_request(DeviceIdPair::new(remote, local))
                .await?
        }
        StepAction::Status => {
            let status = handle.status().await?;
            for line in format_status(&status).lines() {
                info!("{}", line);
            }
        }
    }

    Ok(())
}

/// Human-readable slot table and queue
pub fn format_status(status: &AdvertiserStatus) -> String {
    let mut out = String::new();
    for (index, slot) in status.slots.iter().enumerate() {
        let _ = match slot {
            SlotState::Empty => writeln!(out, "slot {index}: empty"),
            SlotState::Requested {
                device_id_pair,
                priority,
            } => writeln!(
                out,
                "slot {index}: {device_id_pair} ({priority}), waiting for previous advertisement"
            ),
            SlotState::Advertising {
                device_id_pair,
                priority,
            } => writeln!(out, "slot {index}: {device_id_pair} ({priority}), advertising"),
            SlotState::Stopping { previous } => {
                writeln!(out, "slot {index}: stopping {previous}")
            }
        };
    }

    if status.queued.is_empty() {
        out.push_str("queue: empty\n");
    } else {
        for (position, (request, priority)) in status.queued.iter().enumerate() {
            let _ = writeln!(out, "queue {position}: {request} ({priority})");
        }
    }
    out
}

/// Human-readable report
pub fn format_report(report: &SimReport) -> String {
    let mut out = String::new();

    out.push_str("Slot ended notifications:\n");
    if report.slot_ended.is_empty() {
        out.push_str("  (none)\n");
    }
    for (elapsed_ms, ended) in &report.slot_ended {
        let reason = if ended.replaced_by_higher_priority {
            "preempted"
        } else {
            "timeslot over"
        };
        let _ = writeln!(out, "  {elapsed_ms:>6}ms  {}  {reason}", ended.device_id_pair);
    }

    out.push_str("\nFinal state:\n");
    for line in format_status(&report.final_status).lines() {
        let _ = writeln!(out, "  {line}");
    }

    let stats = &report.backend;
    let _ = writeln!(
        out,
        "\nController: {} registrations, {} unregistrations, {} failed commands, peak {} active",
        stats.registrations, stats.unregistrations, stats.failed_commands, stats.peak_active
    );
    if !report.leaked.is_empty() {
        let _ = writeln!(
            out,
            "WARNING: {} advertisements still registered after shutdown",
            report.leaked.len()
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use ble_advertiser::{AdvertiserConfig, ConnectionPriority};

    use crate::config::BackendConfig;

    fn add(at_ms: u64, remote: &str, priority: ConnectionPriority) -> Step {
        Step {
            at_ms,
            action: StepAction::Add {
                remote: remote.to_string(),
                local: "local".to_string(),
                priority,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_scenario() {
        let config = SimConfig {
            run_for_ms: 10_500,
            advertiser: AdvertiserConfig::new()
                .with_max_concurrent_advertisements(1)
                .with_timeslot_duration(Duration::from_secs(5)),
            backend: BackendConfig {
                latency_ms: 10,
                ..Default::default()
            },
            steps: vec![
                add(0, "a", ConnectionPriority::Low),
                add(0, "b", ConnectionPriority::Low),
            ],
        };

        let report = run(&config).await.unwrap();

        let ended: Vec<_> = report
            .slot_ended
            .iter()
            .map(|(_, ended)| ended.device_id_pair.remote_device_id().to_string())
            .collect();
        assert_eq!(ended, vec!["a", "b"]);
        assert_eq!(report.advertising_at_end, vec![DeviceIdPair::new("a", "local")]);
        assert!(report.leaked.is_empty());
        assert_eq!(report.backend.registrations, 3);
        assert_eq!(report.backend.unregistrations, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preemption_scenario() {
        let config = SimConfig {
            run_for_ms: 1_000,
            advertiser: AdvertiserConfig::new().with_max_concurrent_advertisements(1),
            backend: BackendConfig::default(),
            steps: vec![
                add(0, "low", ConnectionPriority::Low),
                add(100, "high", ConnectionPriority::High),
            ],
        };

        let report = run(&config).await.unwrap();

        assert_eq!(report.slot_ended.len(), 1);
        assert!(report.slot_ended[0].1.replaced_by_higher_priority);
        assert_eq!(report.final_status.queued.len(), 1);
        assert_eq!(
            report.advertising_at_end,
            vec![DeviceIdPair::new("high", "local")]
        );
        assert!(report.leaked.is_empty());
    }

    #[test]
    fn test_format_status_lists_slots_and_queue() {
        let status = AdvertiserStatus {
            slots: vec![
                SlotState::Advertising {
                    device_id_pair: DeviceIdPair::new("a", "b"),
                    priority: ConnectionPriority::High,
                },
                SlotState::Empty,
            ],
            queued: vec![(DeviceIdPair::new("c", "d"), ConnectionPriority::Low)],
        };

        let text = format_status(&status);
        assert!(text.contains("slot 0: remote=a, local=b (high), advertising"));
        assert!(text.contains("slot 1: empty"));
        assert!(text.contains("queue 0: remote=c, local=d (low)"));
    }
}
