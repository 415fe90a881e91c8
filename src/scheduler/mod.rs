//! Fleet scheduler
//!
//! Matches idle devices with queued work under the energy admission gate.
//!
//! # Job lifecycle
//!
//! ```text
//!   queued ──(commit)──▶ printing ◀──▶ paused
//!     │                     │            │
//!     ▼                     ▼            ▼
//!  cancelled        completed | failed | cancelled
//! ```
//!
//! The intermediate `assigned` state lives on the queue entry. Moving an
//! entry to `assigned` and its job to `printing` is one store transaction.
//!
//! # Critical section
//!
//! The matching tick and the manual assignment path share one
//! `tokio::sync::Mutex`. Inside it: admission check, idle/candidate
//! snapshot, commits. Start signals are never sent inside the lock; each is
//! a spawned task delayed by its stagger offset.
//!
//! # Modules
//!
//! - [`queue`] - positional pairing and stagger offsets
//! - [`error`] - typed scheduler errors

pub mod error;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::energy::{Admission, EnergyController};
use crate::events::{EventBus, FleetEvent, QueueChange};
use crate::metrics;
use crate::models::{
    Conflict, ConflictKind, Device, DeviceStatus, EnergyReading, JobStatus, NewWorkUnit,
    Priority, QueueEntry, QueueStatus, Resolution, WorkUnit,
};
use crate::storage::{FleetStore, StoreError};
use crate::tracker::DeviceClient;

pub use error::{SchedulerError, SchedulerResult};

// ============================================================================
// Results
// ============================================================================

/// One committed pairing
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub entry: QueueEntry,
    pub job: WorkUnit,
    pub device_id: String,
    /// Delay before the start signal is sent
    pub start_delay_secs: u64,
}

/// Result of a matching tick
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Admission gate closed; nothing was read or written
    Blocked {
        reading: EnergyReading,
        threshold_kw: f64,
    },
    Completed {
        assignments: Vec<Assignment>,
        idle_devices: usize,
        candidates: usize,
    },
}

impl TickOutcome {
    pub fn assigned(&self) -> usize {
        match self {
            Self::Blocked { .. } => 0,
            Self::Completed { assignments, .. } => assignments.len(),
        }
    }
}

/// What startup reconciliation did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Entry ids whose commit was completed
    pub replayed: Vec<String>,
    /// Entry ids returned to the queue
    pub reverted: Vec<String>,
    /// Printing jobs whose start signal was dropped; watched for staleness from now on
    pub unsignaled: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.replayed.is_empty() && self.reverted.is_empty() && self.unsignaled.is_empty()
    }
}

// ============================================================================
// Fleet Scheduler
// ============================================================================

pub struct FleetScheduler {
    store: Arc<FleetStore>,
    events: EventBus,
    energy: Arc<EnergyController>,
    client: Arc<dyn DeviceClient>,
    /// Shared by the tick and the manual path
    assignment_lock: Mutex<()>,
    /// Deferred start signals
    starts: Mutex<JoinSet<()>>,
}

impl FleetScheduler {
    pub fn new(
        store: Arc<FleetStore>,
        events: EventBus,
        energy: Arc<EnergyController>,
        client: Arc<dyn DeviceClient>,
    ) -> Self {
        Self {
            store,
            events,
            energy,
            client,
            assignment_lock: Mutex::new(()),
            starts: Mutex::new(JoinSet::new()),
        }
    }

    // ========================================================================
    // Matching
    // ========================================================================

    /// Run one matching pass
    pub async fn tick(&self) -> SchedulerResult<TickOutcome> {
        let _guard = self.assignment_lock.lock().await;
        let _timer = metrics::start_tick_timer();

        if let Admission::Blocked {
            reading,
            threshold_kw,
            ..
        } = self.energy.check_admission().await?
        {
            tracing::info!(
                current_kw = reading.current_kw,
                threshold_kw,
                "Tick skipped, admission blocked"
            );
            return Ok(TickOutcome::Blocked {
                reading,
                threshold_kw,
            });
        }

        let idle = self.store.idle_devices()?;
        let candidates = self.store.candidate_entries()?;
        let settings = self.store.energy_settings()?;
        metrics::update_queue_depth(candidates.len());

        let mut assignments = Vec::new();
        for (device, entry) in queue::pair(&idle, &candidates) {
            match self.store.commit_assignment(&entry.id, &device.id, Utc::now()) {
                Ok((entry, job)) => {
                    let delay = queue::stagger_offset(assignments.len(), &settings);
                    assignments.push(self.dispatch(device.clone(), entry, job, delay).await);
                }
                Err(e) => {
                    tracing::warn!(
                        entry_id = %entry.id,
                        device_id = %device.id,
                        error = %e,
                        "Assignment commit skipped"
                    );
                }
            }
        }

        metrics::record_assignments("tick", assignments.len());
        if !assignments.is_empty() {
            tracing::info!(
                assigned = assignments.len(),
                idle = idle.len(),
                queued = candidates.len(),
                "Tick assigned work"
            );
        }

        Ok(TickOutcome::Completed {
            assignments,
            idle_devices: idle.len(),
            candidates: candidates.len(),
        })
    }

    /// Operator-chosen pairing; same lock, same checks, same gate as a tick
    pub async fn assign(&self, entry_id: &str, device_id: &str) -> SchedulerResult<Assignment> {
        let _guard = self.assignment_lock.lock().await;

        let entry = self
            .store
            .get_queue_entry(entry_id)?
            .ok_or_else(|| SchedulerError::NotFound {
                entity: "queue entry",
                id: entry_id.to_string(),
            })?;
        if entry.status != QueueStatus::Queued || entry.device_id.is_some() {
            return Err(SchedulerError::AlreadyAssigned {
                entry_id: entry.id,
                status: entry.status.as_str().to_string(),
                device_id: entry.device_id,
            });
        }

        let device = self
            .store
            .get_device(device_id)?
            .ok_or_else(|| SchedulerError::NotFound {
                entity: "device",
                id: device_id.to_string(),
            })?;
        if !device.active {
            return Err(SchedulerError::DeviceBusy {
                device_id: device.id,
                reason: "deactivated".to_string(),
            });
        }
        if device.current_status != DeviceStatus::Idle {
            return Err(SchedulerError::DeviceBusy {
                reason: format!("status is {}", device.current_status),
                device_id: device.id,
            });
        }
        if let Some(job) = self.store.device_active_job(&device.id)? {
            return Err(SchedulerError::DeviceBusy {
                device_id: device.id,
                reason: format!("holding job {}", job.id),
            });
        }

        if let Admission::Blocked {
            reading,
            threshold_kw,
            ..
        } = self.energy.check_admission().await?
        {
            return Err(SchedulerError::EnergyThreshold {
                reading,
                threshold_kw,
            });
        }

        let (entry, job) = self
            .store
            .commit_assignment(&entry.id, &device.id, Utc::now())?;
        metrics::record_assignments("manual", 1);
        tracing::info!(entry_id = %entry.id, device_id = %device.id, job_id = %job.id, "Manual assignment");

        Ok(self.dispatch(device, entry, job, Duration::ZERO).await)
    }

    /// Publish the assignment and schedule its start signal
    async fn dispatch(
        &self,
        device: Device,
        entry: QueueEntry,
        job: WorkUnit,
        delay: Duration,
    ) -> Assignment {
        self.events
            .publish(FleetEvent::queue(QueueChange::Assigned, &entry));

        let assignment = Assignment {
            entry: entry.clone(),
            job: job.clone(),
            device_id: device.id.clone(),
            start_delay_secs: delay.as_secs(),
        };

        let client = self.client.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let mut starts = self.starts.lock().await;
        while starts.try_join_next().is_some() {}
        starts.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let sent = client.start_job(&device, &job).await;
            // A failed signal is stamped too; the idle device then surfaces as stale
            if let Err(e) = store.mark_start_signaled(&job.id, &device.id, Utc::now()) {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record start signal");
            }
            match sent {
                Ok(()) => {
                    tracing::info!(device_id = %device.id, job_id = %job.id, "Start signal sent");
                    events.publish(FleetEvent::queue(QueueChange::DeviceStarted, &entry));
                }
                Err(e) => {
                    metrics::record_start_signal_failure();
                    tracing::warn!(
                        device_id = %device.id,
                        job_id = %job.id,
                        error = %e,
                        "Start signal failed"
                    );
                }
            }
        });

        assignment
    }

    /// Wait for every pending start signal
    pub async fn wait_for_starts(&self) {
        let mut starts = self.starts.lock().await;
        while starts.join_next().await.is_some() {}
    }

    /// Drop pending start signals
    pub async fn cancel_starts(&self) {
        let mut starts = self.starts.lock().await;
        let pending = starts.len();
        starts.abort_all();
        if pending > 0 {
            tracing::warn!(pending, "Pending start signals cancelled");
        }
    }

    /// Matching loop; exits when `shutdown` flips to true
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = interval.as_secs(), "Scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.cancel_starts().await;
        tracing::info!("Scheduler stopped");
    }

    // ========================================================================
    // Queue operations
    // ========================================================================

    /// Submit a job at its priority's default rank
    pub async fn enqueue(&self, new: NewWorkUnit) -> SchedulerResult<(WorkUnit, QueueEntry)> {
        if new.name.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "job name must not be empty".to_string(),
            ));
        }
        if !new.weight.is_finite() || new.weight < 0.0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "weight must be zero or more, got {}",
                new.weight
            )));
        }

        let (job, entry) = self.store.enqueue(&new, new.priority.rank())?;
        tracing::info!(job_id = %job.id, entry_id = %entry.id, priority = job.priority.as_str(), "Job enqueued");
        self.events
            .publish(FleetEvent::queue(QueueChange::Enqueued, &entry));
        Ok((job, entry))
    }

    pub async fn change_priority(
        &self,
        entry_id: &str,
        priority: Priority,
    ) -> SchedulerResult<QueueEntry> {
        let _guard = self.assignment_lock.lock().await;
        let entry = self.store.change_priority(entry_id, priority.rank())?;
        tracing::info!(entry_id, rank = entry.priority_rank, "Priority changed");
        self.events
            .publish(FleetEvent::queue(QueueChange::PriorityChanged, &entry));
        Ok(entry)
    }

    /// Remove a queued entry; its job becomes cancelled
    pub async fn remove(&self, entry_id: &str) -> SchedulerResult<QueueEntry> {
        let _guard = self.assignment_lock.lock().await;
        let entry = self.store.remove_entry(entry_id, Utc::now())?;
        tracing::info!(entry_id, job_id = %entry.job_id, "Queue entry removed");
        self.events
            .publish(FleetEvent::queue(QueueChange::Removed, &entry));
        Ok(entry)
    }

    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
    ) -> SchedulerResult<WorkUnit> {
        let _guard = self.assignment_lock.lock().await;
        let job = self.store.update_job_status(job_id, status, Utc::now())?;
        tracing::info!(job_id, status = %job.status, "Job status updated");
        self.publish_status_change(job_id)?;
        Ok(job)
    }

    pub fn list_queue(&self) -> SchedulerResult<Vec<QueueEntry>> {
        Ok(self.store.list_queue()?)
    }

    pub fn get_job(&self, job_id: &str) -> SchedulerResult<WorkUnit> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| SchedulerError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })
    }

    // ========================================================================
    // Conflicts and recovery
    // ========================================================================

    pub fn list_conflicts(&self, open_only: bool) -> SchedulerResult<Vec<Conflict>> {
        Ok(self.store.list_conflicts(open_only)?)
    }

    /// Apply an operator decision to an open conflict
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> SchedulerResult<Conflict> {
        let _guard = self.assignment_lock.lock().await;
        let conflict = self
            .store
            .resolve_conflict(conflict_id, resolution, Utc::now())?;
        tracing::info!(
            conflict_id,
            job_id = %conflict.job_id,
            resolution = resolution.as_str(),
            "Conflict resolved"
        );
        if matches!(resolution, Resolution::MarkCompleted | Resolution::MarkFailed) {
            self.publish_status_change(&conflict.job_id)?;
        }
        Ok(conflict)
    }

    /// Startup reconciliation of commits interrupted between their two halves
    pub async fn recover(&self) -> SchedulerResult<RecoveryReport> {
        let _guard = self.assignment_lock.lock().await;
        let settings = self.store.energy_settings()?;
        let mut report = RecoveryReport::default();

        for job_id in self.store.stamp_unsignaled_jobs(Utc::now())? {
            tracing::warn!(job_id = %job_id, "Start signal never sent before restart");
            report.unsignaled.push(job_id);
        }

        for entry in self.store.interrupted_assignments()? {
            let Some(device_id) = entry.device_id.clone() else {
                continue;
            };
            let device = self.store.get_device(&device_id)?;

            let replayable = device
                .as_ref()
                .is_some_and(|d| d.active && d.current_status == DeviceStatus::Idle);

            if let (true, Some(device)) = (replayable, device) {
                match self.store.replay_assignment(&entry.id, Utc::now()) {
                    Ok(job) => {
                        self.store.record_resolved_conflict(
                            ConflictKind::InterruptedCommit,
                            &job.id,
                            Some(&device_id),
                            "assignment committed without job transition; replayed",
                            Resolution::Replayed,
                        )?;
                        tracing::warn!(entry_id = %entry.id, device_id = %device_id, "Interrupted commit replayed");

                        let delay = queue::stagger_offset(report.replayed.len(), &settings);
                        report.replayed.push(entry.id.clone());
                        let entry = self
                            .store
                            .get_queue_entry(&entry.id)?
                            .unwrap_or(entry);
                        self.dispatch(device, entry, job, delay).await;
                        continue;
                    }
                    Err(
                        e @ (StoreError::DeviceOccupied { .. }
                        | StoreError::DeviceInactive { .. }
                        | StoreError::EntryNotQueued { .. }
                        | StoreError::NotFound { .. }),
                    ) => {
                        tracing::debug!(entry_id = %entry.id, error = %e, "Replay refused, reverting");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let reverted = self.store.revert_assignment(&entry.id)?;
            self.store.record_resolved_conflict(
                ConflictKind::InterruptedCommit,
                &reverted.job_id,
                Some(&device_id),
                "assignment committed without job transition; device unavailable, reverted",
                Resolution::Reverted,
            )?;
            tracing::warn!(entry_id = %entry.id, device_id = %device_id, "Interrupted commit reverted");
            report.reverted.push(reverted.id);
        }

        if !report.is_empty() {
            tracing::info!(
                replayed = report.replayed.len(),
                reverted = report.reverted.len(),
                unsignaled = report.unsignaled.len(),
                "Recovery complete"
            );
        }
        Ok(report)
    }

    fn publish_status_change(&self, job_id: &str) -> SchedulerResult<()> {
        if let Some(entry) = self.store.entry_for_job(job_id)? {
            self.events
                .publish(FleetEvent::queue(QueueChange::StatusChanged, &entry));
        }
        Ok(())
    }
}
