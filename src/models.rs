//! Core data structures for the printer fleet
//!
//! Devices, telemetry readings, jobs, queue entries and the energy records
//! shared by the tracker, the energy controller and the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Device Status
// ============================================================================

/// Canonical status of a fleet device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Unreachable or never polled
    #[default]
    Offline,
    /// Ready to accept a job
    Idle,
    /// Executing a job
    Printing,
    /// Job suspended on the device
    Paused,
    /// Device reported a fault
    Error,
    /// Taken out of rotation by an operator
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Idle => "idle",
            Self::Printing => "printing",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
        }
    }

    /// Map a vendor state string onto the canonical vocabulary.
    ///
    /// Unknown states map to `Offline`.
    pub fn from_vendor(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "idle" | "ready" | "standby" | "operational" | "complete" => Self::Idle,
            "printing" | "busy" | "running" => Self::Printing,
            "paused" | "pausing" => Self::Paused,
            "error" | "shutdown" | "fault" | "failed" => Self::Error,
            "maintenance" => Self::Maintenance,
            _ => Self::Offline,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses the stored column value; vendor text goes through [`DeviceStatus::from_vendor`]
impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(Self::Offline),
            "idle" => Ok(Self::Idle),
            "printing" => Ok(Self::Printing),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// A fleet-managed printer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Network address used for status queries (`host:port` or a base URL)
    pub address: String,
    pub max_extruder_temp: f64,
    pub max_bed_temp: f64,
    /// Nominal power rating in kW
    pub rated_power_kw: f64,
    pub active: bool,
    /// Status of the most recent reading
    pub current_status: DeviceStatus,
    /// Power draw estimate of the most recent reading
    pub current_power_kw: f64,
    /// Consecutive idle readings
    pub idle_streak: u32,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Base URL for HTTP queries
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.address)
        }
    }
}

/// Operator request to register a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDevice {
    pub name: String,
    pub address: String,
    #[serde(default = "default_max_extruder_temp")]
    pub max_extruder_temp: f64,
    #[serde(default = "default_max_bed_temp")]
    pub max_bed_temp: f64,
    #[serde(default = "default_rated_power_kw")]
    pub rated_power_kw: f64,
}

fn default_max_extruder_temp() -> f64 {
    260.0
}

fn default_max_bed_temp() -> f64 {
    110.0
}

fn default_rated_power_kw() -> f64 {
    0.35
}

impl NewDevice {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            max_extruder_temp: default_max_extruder_temp(),
            max_bed_temp: default_max_bed_temp(),
            rated_power_kw: default_rated_power_kw(),
        }
    }
}

// ============================================================================
// Device Reading
// ============================================================================

/// Immutable telemetry snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub device_id: String,
    pub temperature_extruder: f64,
    pub temperature_bed: f64,
    /// Job progress in percent (0-100)
    pub progress: f64,
    pub status: DeviceStatus,
    pub fan_speed: f64,
    pub power_draw_kw: f64,
    pub recorded_at: DateTime<Utc>,
}

impl DeviceReading {
    /// Reading synthesized for an unreachable device
    pub fn offline(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            temperature_extruder: 0.0,
            temperature_bed: 0.0,
            progress: 0.0,
            status: DeviceStatus::Offline,
            fan_speed: 0.0,
            power_draw_kw: 0.0,
            recorded_at: Utc::now(),
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Printing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Printing => "printing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether an operator may move a job from `self` to `next`.
    ///
    /// `queued -> printing` is reserved for the scheduler commit.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Printing, Paused)
                | (Paused, Printing)
                | (Printing, Completed | Failed | Cancelled)
                | (Paused, Completed | Failed | Cancelled)
                | (Queued, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "printing" => Ok(Self::Printing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Coarse job priority chosen by the submitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Default numeric queue rank (lower is more urgent)
    pub fn rank(&self) -> i64 {
        match self {
            Self::High => 1,
            Self::Medium => 5,
            Self::Low => 10,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// A unit of production work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub priority: Priority,
    /// Filament weight in grams
    pub weight: f64,
    pub estimated_duration_secs: u64,
    pub assigned_device_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Submission payload for a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkUnit {
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub estimated_duration_secs: u64,
}

impl NewWorkUnit {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            priority,
            weight: 0.0,
            estimated_duration_secs: 0,
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for a device
    Queued,
    /// Device chosen, job transition committed or in progress
    Assigned,
    /// Job reached a terminal state or the entry was removed
    Done,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Done => "done",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// Schedulable wrapper binding a job to ordering metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub job_id: String,
    /// Lower rank is served first
    pub priority_rank: i64,
    pub enqueued_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub device_id: Option<String>,
}

// ============================================================================
// Energy
// ============================================================================

/// Operator-tunable energy policy (singleton)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergySettings {
    pub max_load_kw: f64,
    pub peak_protection_enabled: bool,
    pub stagger_enabled: bool,
    pub stagger_delay_secs: i64,
    pub base_load_kw: f64,
}

impl Default for EnergySettings {
    fn default() -> Self {
        Self {
            max_load_kw: 6.0,
            peak_protection_enabled: true,
            stagger_enabled: true,
            stagger_delay_secs: 30,
            base_load_kw: 0.5,
        }
    }
}

/// Where a load sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    Meter,
    Estimate,
}

impl LoadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meter => "meter",
            Self::Estimate => "estimate",
        }
    }
}

impl FromStr for LoadSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meter" => Ok(Self::Meter),
            "estimate" => Ok(Self::Estimate),
            other => Err(format!("unknown load source: {other}")),
        }
    }
}

/// Aggregate load sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyReading {
    pub current_kw: f64,
    pub max_kw: f64,
    pub active_device_count: u32,
    pub source: LoadSource,
    pub recorded_at: DateTime<Utc>,
}

/// Kind of power event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEventKind {
    /// An assignment was refused by the admission gate
    AdmissionBlocked,
    /// A load sample crossed the protection threshold
    ThresholdBreach,
}

impl PowerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionBlocked => "admission_blocked",
            Self::ThresholdBreach => "threshold_breach",
        }
    }
}

impl FromStr for PowerEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admission_blocked" => Ok(Self::AdmissionBlocked),
            "threshold_breach" => Ok(Self::ThresholdBreach),
            other => Err(format!("unknown power event kind: {other}")),
        }
    }
}

/// Immutable audit row for gate rejections and breaches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerEvent {
    pub kind: PowerEventKind,
    pub current_kw: f64,
    pub limit_kw: f64,
    pub threshold_kw: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Reconciliation conflicts
// ============================================================================

/// Kind of state inconsistency awaiting an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Job printing while its device keeps reporting idle
    StalePrinting,
    /// Queue entry assigned without the job reaching printing
    InterruptedCommit,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StalePrinting => "stale_printing",
            Self::InterruptedCommit => "interrupted_commit",
        }
    }
}

impl FromStr for ConflictKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stale_printing" => Ok(Self::StalePrinting),
            "interrupted_commit" => Ok(Self::InterruptedCommit),
            other => Err(format!("unknown conflict kind: {other}")),
        }
    }
}

/// Operator decision for an open conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepPrinting,
    MarkCompleted,
    MarkFailed,
    /// Recorded by startup recovery
    Replayed,
    /// Recorded by startup recovery
    Reverted,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepPrinting => "keep_printing",
            Self::MarkCompleted => "mark_completed",
            Self::MarkFailed => "mark_failed",
            Self::Replayed => "replayed",
            Self::Reverted => "reverted",
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep_printing" => Ok(Self::KeepPrinting),
            "mark_completed" => Ok(Self::MarkCompleted),
            "mark_failed" => Ok(Self::MarkFailed),
            "replayed" => Ok(Self::Replayed),
            "reverted" => Ok(Self::Reverted),
            other => Err(format!("unknown resolution: {other}")),
        }
    }
}

/// A recorded inconsistency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub kind: ConflictKind,
    pub job_id: String,
    pub device_id: Option<String>,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_status_mapping() {
        assert_eq!(DeviceStatus::from_vendor("Operational"), DeviceStatus::Idle);
        assert_eq!(DeviceStatus::from_vendor("standby"), DeviceStatus::Idle);
        assert_eq!(DeviceStatus::from_vendor("printing"), DeviceStatus::Printing);
        assert_eq!(DeviceStatus::from_vendor("pausing"), DeviceStatus::Paused);
        assert_eq!(DeviceStatus::from_vendor("shutdown"), DeviceStatus::Error);
        assert_eq!(DeviceStatus::from_vendor("warming_up"), DeviceStatus::Offline);
        assert_eq!(DeviceStatus::from_vendor(""), DeviceStatus::Offline);
    }

    #[test]
    fn test_job_transitions() {
        assert!(JobStatus::Printing.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Printing));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Printing));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Printing));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_stored_values_reject_unknown_text() {
        assert_eq!("offline".parse::<DeviceStatus>(), Ok(DeviceStatus::Offline));
        assert_eq!("maintenance".parse::<DeviceStatus>(), Ok(DeviceStatus::Maintenance));
        assert!("Operational".parse::<DeviceStatus>().is_err());
        assert_eq!("estimate".parse::<LoadSource>(), Ok(LoadSource::Estimate));
        assert!("guess".parse::<LoadSource>().is_err());
        assert_eq!(
            "threshold_breach".parse::<PowerEventKind>(),
            Ok(PowerEventKind::ThresholdBreach)
        );
        assert!("brownout".parse::<PowerEventKind>().is_err());
        assert_eq!(
            "interrupted_commit".parse::<ConflictKind>(),
            Ok(ConflictKind::InterruptedCommit)
        );
        assert!("".parse::<ConflictKind>().is_err());
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
    }

    #[test]
    fn test_device_base_url() {
        let mut device = Device {
            id: "d1".to_string(),
            name: "mk4".to_string(),
            address: "10.0.0.5:7125".to_string(),
            max_extruder_temp: 260.0,
            max_bed_temp: 110.0,
            rated_power_kw: 0.35,
            active: true,
            current_status: DeviceStatus::Offline,
            current_power_kw: 0.0,
            idle_streak: 0,
            status_changed_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(device.base_url(), "http://10.0.0.5:7125");

        device.address = "https://printer.local/".to_string();
        assert_eq!(device.base_url(), "https://printer.local");
    }

    #[test]
    fn test_energy_settings_serde() {
        let settings = EnergySettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: EnergySettings = serde_json::from_str(&json).unwrap();
        assert_eq!(settings, back);
    }
}
