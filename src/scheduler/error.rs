//! Error types for the scheduler module

use thiserror::Error;

use crate::models::{EnergyReading, JobStatus};
use crate::storage::StoreError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Device cannot take work right now
    #[error("device {device_id} is busy: {reason}")]
    DeviceBusy { device_id: String, reason: String },

    /// Queue entry was already claimed or closed
    #[error("queue entry {entry_id} is already {status}")]
    AlreadyAssigned {
        entry_id: String,
        status: String,
        device_id: Option<String>,
    },

    /// Admission gate refused the assignment
    #[error(
        "fleet load {:.2} kW is at or above the admission threshold {threshold_kw:.2} kW",
        .reading.current_kw
    )]
    EnergyThreshold {
        reading: EnergyReading,
        threshold_kw: f64,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl SchedulerError {
    /// Whether the same request could succeed later without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::EnergyThreshold { .. } => true,
            Self::Store(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::EntryNotQueued {
                entry_id,
                status,
                device_id,
            } => Self::AlreadyAssigned {
                entry_id,
                status,
                device_id,
            },
            StoreError::InvalidTransition { job_id, from, to } => {
                Self::InvalidTransition { job_id, from, to }
            }
            StoreError::DeviceOccupied { device_id, job_id } => Self::DeviceBusy {
                device_id,
                reason: format!("holding job {job_id}"),
            },
            StoreError::DeviceInactive { device_id } => Self::DeviceBusy {
                device_id,
                reason: "deactivated".to_string(),
            },
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflicts_become_typed_errors() {
        let err: SchedulerError = StoreError::DeviceOccupied {
            device_id: "d1".to_string(),
            job_id: "j1".to_string(),
        }
        .into();
        assert!(matches!(err, SchedulerError::DeviceBusy { .. }));
        assert!(!err.is_recoverable());

        let err: SchedulerError = StoreError::EntryNotQueued {
            entry_id: "e1".to_string(),
            status: "assigned".to_string(),
            device_id: Some("d1".to_string()),
        }
        .into();
        assert_eq!(err.to_string(), "queue entry e1 is already assigned");
    }

    #[test]
    fn test_lock_poisoning_stays_a_store_error() {
        let err: SchedulerError = StoreError::LockPoisoned.into();
        assert!(matches!(err, SchedulerError::Store(StoreError::LockPoisoned)));
    }
}
