//! Transactional persistence for fleet state
//!
//! All entities live in one SQLite database. Every multi-row change that must
//! be atomic (history append plus status update, the two-step assignment
//! commit, conflict resolution) runs inside a single transaction.

pub mod repository;

use thiserror::Error;

use crate::models::{JobStatus, QueueStatus};

pub use repository::{FleetLoad, FleetStore, ReadingAppend};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    LockPoisoned,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("queue entry {entry_id} is {status}, expected queued")]
    EntryNotQueued {
        entry_id: String,
        status: String,
        device_id: Option<String>,
    },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("device {device_id} is occupied by job {job_id}")]
    DeviceOccupied { device_id: String, job_id: String },

    #[error("device {device_id} is deactivated")]
    DeviceInactive { device_id: String },

    #[error("conflict {id} is already resolved")]
    AlreadyResolved { id: String },

    #[error("resolution '{resolution}' cannot be applied by an operator")]
    InvalidResolution { resolution: String },
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn entry_not_queued(
        entry_id: impl Into<String>,
        status: QueueStatus,
        device_id: Option<String>,
    ) -> Self {
        Self::EntryNotQueued {
            entry_id: entry_id.into(),
            status: status.as_str().to_string(),
            device_id,
        }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::Io(_))
    }
}
