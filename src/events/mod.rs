//! Outbound fleet events
//!
//! Components publish [`FleetEvent`]s on a shared [`EventBus`] backed by a
//! `tokio::sync::broadcast` channel. Delivery is at-most-once: publishing
//! with no subscribers is not an error, and a lagging subscriber loses the
//! oldest events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{DeviceReading, EnergyReading, PowerEvent, QueueEntry};

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// ============================================================================
// Event payloads
// ============================================================================

/// Which sensor crossed its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensor {
    Extruder,
    Bed,
}

impl Sensor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extruder => "extruder",
            Self::Bed => "bed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// A temperature exceeded the device limit
    ThermalLimit,
    /// A printing job's device keeps reporting idle
    StalePrinting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// What happened to a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueChange {
    Enqueued,
    Assigned,
    /// Start signal delivered to the device
    DeviceStarted,
    PriorityChanged,
    Removed,
    /// Job moved through the operator state machine
    StatusChanged,
}

/// Event published on the bus, tagged by topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum FleetEvent {
    #[serde(rename = "device.telemetry")]
    Telemetry { reading: DeviceReading },

    #[serde(rename = "device.anomaly")]
    Anomaly {
        device_id: String,
        kind: AnomalyKind,
        severity: Severity,
        sensor: Option<Sensor>,
        value: Option<f64>,
        limit: Option<f64>,
        job_id: Option<String>,
        detail: String,
        detected_at: DateTime<Utc>,
    },

    #[serde(rename = "queue.updated")]
    QueueUpdated {
        change: QueueChange,
        entry_id: String,
        job_id: String,
        device_id: Option<String>,
        priority_rank: i64,
        at: DateTime<Utc>,
    },

    #[serde(rename = "energy.reading")]
    EnergySample { reading: EnergyReading },

    #[serde(rename = "power.event")]
    Power { event: PowerEvent },
}

impl FleetEvent {
    /// Topic name used on the wire
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Telemetry { .. } => "device.telemetry",
            Self::Anomaly { .. } => "device.anomaly",
            Self::QueueUpdated { .. } => "queue.updated",
            Self::EnergySample { .. } => "energy.reading",
            Self::Power { .. } => "power.event",
        }
    }

    /// Queue event for an entry
    pub fn queue(change: QueueChange, entry: &QueueEntry) -> Self {
        Self::QueueUpdated {
            change,
            entry_id: entry.id.clone(),
            job_id: entry.job_id.clone(),
            device_id: entry.device_id.clone(),
            priority_rank: entry.priority_rank,
            at: Utc::now(),
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast publisher shared by all components
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns the number of subscribers reached
    pub fn publish(&self, event: FleetEvent) -> usize {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(count) => {
                tracing::trace!(topic, subscribers = count, "Event published");
                count
            }
            Err(_) => 0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
