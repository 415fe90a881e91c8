//! Integration tests for the fleet scheduler
//!
//! These tests verify the complete workflow of:
//! - Admission gating of matching ticks
//! - Priority and FIFO ordering
//! - Manual assignment conflicts
//! - Staggered start signals
//! - Startup reconciliation of interrupted commits

mod common;

use std::time::Duration;

use common::{device_with_status, idle_device, test_fleet};
use printfleet::config::Config;
use printfleet::energy::SettingsUpdate;
use printfleet::fleet::{Fleet, FleetContext};
use printfleet::models::{
    ConflictKind, DeviceStatus, JobStatus, NewWorkUnit, PowerEventKind, Priority, QueueStatus,
    Resolution,
};
use printfleet::scheduler::{SchedulerError, TickOutcome};
use std::sync::Arc;

async fn enqueue(fleet: &Fleet, name: &str, priority: Priority) -> String {
    let (_, entry) = fleet
        .scheduler
        .enqueue(NewWorkUnit::new(name, priority))
        .await
        .unwrap();
    entry.id
}

fn disable_stagger(fleet: &Fleet) {
    fleet
        .energy
        .patch_settings(&SettingsUpdate {
            stagger_enabled: Some(false),
            ..SettingsUpdate::default()
        })
        .unwrap();
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_blocked_tick_leaves_state_unchanged() {
    let (fleet, client, _meter) = test_fleet(5.5);
    idle_device(&fleet, "alpha");
    idle_device(&fleet, "beta");
    enqueue(&fleet, "bracket", Priority::High).await;
    enqueue(&fleet, "hinge", Priority::Low).await;

    let before = fleet.scheduler.list_queue().unwrap();
    let outcome = fleet.scheduler.tick().await.unwrap();

    match outcome {
        TickOutcome::Blocked {
            reading,
            threshold_kw,
        } => {
            assert_eq!(reading.current_kw, 5.5);
            assert!((threshold_kw - 5.4).abs() < 1e-9);
        }
        other => panic!("expected blocked tick, got {other:?}"),
    }

    let after = fleet.scheduler.list_queue().unwrap();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(b.status, QueueStatus::Queued);
        assert!(b.device_id.is_none());
        let job = fleet.scheduler.get_job(&b.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }
    assert_eq!(fleet.context.store.idle_devices().unwrap().len(), 2);

    fleet.scheduler.wait_for_starts().await;
    assert!(client.starts().is_empty());
}

#[tokio::test]
async fn test_admission_blocked_at_ninety_percent() {
    let (fleet, _client, _meter) = test_fleet(5.5);
    let settings = fleet.energy.settings().unwrap();
    assert_eq!(settings.max_load_kw, 6.0);

    let admission = fleet.energy.check_admission().await.unwrap();
    assert!(!admission.is_allowed());

    let events = fleet.energy.list_power_events(10).unwrap();
    let blocked: Vec<_> = events
        .iter()
        .filter(|e| e.kind == PowerEventKind::AdmissionBlocked)
        .collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].current_kw, 5.5);
    assert_eq!(blocked[0].limit_kw, 6.0);
}

#[tokio::test]
async fn test_manual_assign_goes_through_gate() {
    let (fleet, _client, meter) = test_fleet(5.9);
    let device = idle_device(&fleet, "alpha");
    let entry_id = enqueue(&fleet, "bracket", Priority::Medium).await;

    let err = fleet
        .scheduler
        .assign(&entry_id, &device.id)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::EnergyThreshold { .. }));
    assert!(err.is_recoverable());

    // Load drops, next sample reopens the gate
    meter.set(1.0);
    fleet.energy.sample().await.unwrap();
    let assignment = fleet.scheduler.assign(&entry_id, &device.id).await.unwrap();
    assert_eq!(assignment.device_id, device.id);
    assert_eq!(assignment.job.status, JobStatus::Printing);
}

// ============================================================================
// Matching
// ============================================================================

#[tokio::test]
async fn test_tick_assigns_min_of_idle_and_queued() {
    let (fleet, _client, _meter) = test_fleet(0.5);
    disable_stagger(&fleet);
    for name in ["alpha", "beta", "gamma"] {
        idle_device(&fleet, name);
    }
    enqueue(&fleet, "one", Priority::Medium).await;
    enqueue(&fleet, "two", Priority::Medium).await;

    let outcome = fleet.scheduler.tick().await.unwrap();
    assert_eq!(outcome.assigned(), 2);

    enqueue(&fleet, "three", Priority::Low).await;
    enqueue(&fleet, "four", Priority::Low).await;
    enqueue(&fleet, "five", Priority::Low).await;

    let outcome = fleet.scheduler.tick().await.unwrap();
    assert_eq!(outcome.assigned(), 1);

    let queued = fleet
        .scheduler
        .list_queue()
        .unwrap()
        .into_iter()
        .filter(|e| e.status == QueueStatus::Queued)
        .count();
    assert_eq!(queued, 2);
    assert!(fleet.context.store.idle_devices().unwrap().is_empty());
}

#[tokio::test]
async fn test_priority_order_with_one_idle_device() {
    let (fleet, _client, _meter) = test_fleet(0.5);
    idle_device(&fleet, "alpha");
    enqueue(&fleet, "low", Priority::Low).await;
    let high = enqueue(&fleet, "high", Priority::High).await;
    enqueue(&fleet, "medium", Priority::Medium).await;

    let outcome = fleet.scheduler.tick().await.unwrap();
    let TickOutcome::Completed { assignments, .. } = outcome else {
        panic!("tick should not be blocked");
    };
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].entry.id, high);
    assert_eq!(assignments[0].job.name, "high");
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    let (fleet, _client, _meter) = test_fleet(0.5);
    idle_device(&fleet, "alpha");
    let first = enqueue(&fleet, "first", Priority::Medium).await;
    let second = enqueue(&fleet, "second", Priority::Medium).await;

    let outcome = fleet.scheduler.tick().await.unwrap();
    let TickOutcome::Completed { assignments, .. } = outcome else {
        panic!("tick should not be blocked");
    };
    assert_eq!(assignments[0].entry.id, first);

    let remaining = fleet.context.store.get_queue_entry(&second).unwrap().unwrap();
    assert_eq!(remaining.status, QueueStatus::Queued);
}

#[tokio::test]
async fn test_lower_rank_wins_over_earlier_insertion() {
    let (fleet, _client, _meter) = test_fleet(0.5);
    let a = idle_device(&fleet, "device-a");
    device_with_status(&fleet, "device-b", DeviceStatus::Printing);

    let p5 = enqueue(&fleet, "p5", Priority::Medium).await;
    let p1 = enqueue(&fleet, "p1", Priority::High).await;

    let outcome = fleet.scheduler.tick().await.unwrap();
    let TickOutcome::Completed { assignments, .. } = outcome else {
        panic!("tick should not be blocked");
    };
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].entry.id, p1);
    assert_eq!(assignments[0].device_id, a.id);

    let other = fleet.context.store.get_queue_entry(&p5).unwrap().unwrap();
    assert_eq!(other.status, QueueStatus::Queued);
    assert!(other.device_id.is_none());
}

#[tokio::test]
async fn test_manual_assign_never_double_assigns() {
    let (fleet, _client, _meter) = test_fleet(0.5);
    let alpha = idle_device(&fleet, "alpha");
    let beta = idle_device(&fleet, "beta");
    let entry_id = enqueue(&fleet, "bracket", Priority::Medium).await;

    fleet.scheduler.assign(&entry_id, &alpha.id).await.unwrap();

    let err = fleet
        .scheduler
        .assign(&entry_id, &beta.id)
        .await
        .unwrap_err();
    match err {
        SchedulerError::AlreadyAssigned { device_id, .. } => {
            assert_eq!(device_id.as_deref(), Some(alpha.id.as_str()));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let entry = fleet.context.store.get_queue_entry(&entry_id).unwrap().unwrap();
    assert_eq!(entry.device_id.as_deref(), Some(alpha.id.as_str()));
    assert!(fleet.context.store.device_active_job(&beta.id).unwrap().is_none());
}

#[tokio::test]
async fn test_tick_after_manual_assign_skips_claimed_device() {
    let (fleet, _client, _meter) = test_fleet(0.5);
    let alpha = idle_device(&fleet, "alpha");
    let first = enqueue(&fleet, "first", Priority::High).await;
    enqueue(&fleet, "second", Priority::High).await;

    fleet.scheduler.assign(&first, &alpha.id).await.unwrap();
    let outcome = fleet.scheduler.tick().await.unwrap();
    assert_eq!(outcome.assigned(), 0);
}

// ============================================================================
// Stagger
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stagger_defers_start_signals() {
    let (fleet, client, _meter) = test_fleet(0.5);
    for name in ["alpha", "beta", "gamma"] {
        idle_device(&fleet, name);
    }
    for name in ["one", "two", "three"] {
        enqueue(&fleet, name, Priority::Medium).await;
    }

    let started = tokio::time::Instant::now();
    let outcome = fleet.scheduler.tick().await.unwrap();
    let TickOutcome::Completed { assignments, .. } = outcome else {
        panic!("tick should not be blocked");
    };

    // The tick commits everything up front and returns without waiting
    let delays: Vec<_> = assignments.iter().map(|a| a.start_delay_secs).collect();
    assert_eq!(delays, vec![0, 30, 60]);
    assert!(client.starts().len() <= 1);

    fleet.scheduler.wait_for_starts().await;
    let mut offsets: Vec<_> = client
        .starts()
        .iter()
        .map(|call| call.at.duration_since(started))
        .collect();
    offsets.sort();
    assert_eq!(offsets.len(), 3);
    assert!(offsets[0] < Duration::from_secs(1));
    assert!(offsets[1] >= Duration::from_secs(30) && offsets[1] < Duration::from_secs(31));
    assert!(offsets[2] >= Duration::from_secs(60) && offsets[2] < Duration::from_secs(61));
}

#[tokio::test(start_paused = true)]
async fn test_staggered_device_not_stale_before_start_signal() {
    let (fleet, client, _meter) = test_fleet(0.5);
    for name in ["alpha", "beta", "gamma"] {
        idle_device(&fleet, name);
    }
    for name in ["one", "two", "three"] {
        enqueue(&fleet, name, Priority::Medium).await;
    }

    let outcome = fleet.scheduler.tick().await.unwrap();
    let TickOutcome::Completed { assignments, .. } = outcome else {
        panic!("tick should not be blocked");
    };
    let last = assignments.last().unwrap();
    assert_eq!(last.start_delay_secs, 60);
    let device = fleet.get_device(&last.device_id).unwrap();
    let stale_after = fleet.context.config.tracker.stale_idle_readings;

    // Polls every 10s while the last start signal is still pending
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        fleet.tracker.poll(&device).await.unwrap();
    }
    assert!(client.starts().iter().all(|call| call.device_id != device.id));
    assert!(fleet.scheduler.list_conflicts(true).unwrap().is_empty());

    // Once started, idle readings count toward staleness
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(client.starts().iter().any(|call| call.device_id == device.id));
    for _ in 0..stale_after - 1 {
        fleet.tracker.poll(&device).await.unwrap();
    }
    assert!(fleet.scheduler.list_conflicts(true).unwrap().is_empty());

    fleet.tracker.poll(&device).await.unwrap();
    let open = fleet.scheduler.list_conflicts(true).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, ConflictKind::StalePrinting);
    assert_eq!(open[0].job_id, last.job.id);
}

#[tokio::test]
async fn test_recovery_stamps_dropped_start_signals() {
    let (fleet, client, _meter) = test_fleet(0.5);
    for name in ["alpha", "beta"] {
        idle_device(&fleet, name);
    }
    for name in ["one", "two"] {
        enqueue(&fleet, name, Priority::Medium).await;
    }

    let outcome = fleet.scheduler.tick().await.unwrap();
    assert_eq!(outcome.assigned(), 2);
    // Shutdown before the staggered signal fires
    fleet.scheduler.cancel_starts().await;
    let signaled = client.starts().len();
    assert!(signaled <= 1);

    let report = fleet.scheduler.recover().await.unwrap();
    assert_eq!(report.unsignaled.len(), 2 - signaled);
    assert!(report.replayed.is_empty() && report.reverted.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stagger_disabled_starts_together() {
    let (fleet, client, _meter) = test_fleet(0.5);
    disable_stagger(&fleet);
    idle_device(&fleet, "alpha");
    idle_device(&fleet, "beta");
    enqueue(&fleet, "one", Priority::Medium).await;
    enqueue(&fleet, "two", Priority::Medium).await;

    let outcome = fleet.scheduler.tick().await.unwrap();
    let TickOutcome::Completed { assignments, .. } = outcome else {
        panic!("tick should not be blocked");
    };
    assert!(assignments.iter().all(|a| a.start_delay_secs == 0));

    fleet.scheduler.wait_for_starts().await;
    assert_eq!(client.starts().len(), 2);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_recovery_replays_and_reverts() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");
    let mut config = Config::default();
    config.database.sqlite_path = db_path.clone();

    let context = FleetContext::init(config).unwrap();
    let client = Arc::new(common::RecordingClient::default());
    let fleet = Fleet::with_clients(context, client.clone(), None);

    let alpha = idle_device(&fleet, "alpha");
    let beta = device_with_status(&fleet, "beta", DeviceStatus::Maintenance);
    let replay = enqueue(&fleet, "replay-me", Priority::Medium).await;
    let revert = enqueue(&fleet, "revert-me", Priority::Medium).await;

    // A crash between the queue update and the job update leaves this behind
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        for (entry_id, device_id) in [(&replay, &alpha.id), (&revert, &beta.id)] {
            conn.execute(
                "UPDATE queue_entries SET status = 'assigned', device_id = ?1 WHERE id = ?2",
                rusqlite::params![device_id, entry_id],
            )
            .unwrap();
        }
    }

    let report = fleet.scheduler.recover().await.unwrap();
    assert_eq!(report.replayed, vec![replay.clone()]);
    assert_eq!(report.reverted, vec![revert.clone()]);

    let replayed = fleet.context.store.get_queue_entry(&replay).unwrap().unwrap();
    let job = fleet.scheduler.get_job(&replayed.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Printing);
    assert_eq!(job.assigned_device_id.as_deref(), Some(alpha.id.as_str()));

    let reverted = fleet.context.store.get_queue_entry(&revert).unwrap().unwrap();
    assert_eq!(reverted.status, QueueStatus::Queued);
    assert!(reverted.device_id.is_none());

    let conflicts = fleet.scheduler.list_conflicts(false).unwrap();
    assert_eq!(conflicts.len(), 2);
    assert!(conflicts
        .iter()
        .all(|c| c.kind == ConflictKind::InterruptedCommit && c.resolved_at.is_some()));
    let mut resolutions: Vec<_> = conflicts.iter().filter_map(|c| c.resolution).collect();
    resolutions.sort_by_key(|r| r.as_str());
    assert_eq!(resolutions, vec![Resolution::Replayed, Resolution::Reverted]);
    assert!(fleet.scheduler.list_conflicts(true).unwrap().is_empty());

    fleet.scheduler.wait_for_starts().await;
    let starts = client.starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].device_id, alpha.id);

    // A second pass finds nothing left to reconcile
    let again = fleet.scheduler.recover().await.unwrap();
    assert!(again.replayed.is_empty() && again.reverted.is_empty());
}
