//! Unified error handling for printfleet
//!
//! This module provides a unified error type that consolidates the
//! domain-specific errors into a single `Error` enum, while keeping the
//! domain errors available where callers need the detail.
//!
//! # Architecture
//!
//! - [`FleetErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification used for handling strategies and HTTP status mapping
//! - [`Error`] - Unified error enum wrapping all domain-specific errors

use thiserror::Error;

pub use crate::energy::SettingsError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::storage::StoreError;
pub use crate::tracker::ProbeError;

/// Common trait for printfleet error types
pub trait FleetErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Device or meter unreachable, timed out, or answered garbage
    Transport,
    /// Admission gate refused the request
    Admission,
    /// Busy device, already-claimed entry, invalid transition
    Conflict,
    /// Rejected input
    Validation,
    NotFound,
    /// Database failures
    Storage,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Admission => "admission",
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
        }
    }
}

/// Unified error type for printfleet
#[derive(Error, Debug)]
pub enum Error {
    /// Scheduler errors (assignment, queue and job transitions)
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Energy settings rejected at the boundary
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Persistence errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Device or meter transport errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Rejected operator input
    #[error("Invalid request: {0}")]
    Invalid(String),
}

fn store_category(err: &StoreError) -> ErrorCategory {
    match err {
        StoreError::NotFound { .. } => ErrorCategory::NotFound,
        StoreError::EntryNotQueued { .. }
        | StoreError::InvalidTransition { .. }
        | StoreError::DeviceOccupied { .. }
        | StoreError::DeviceInactive { .. }
        | StoreError::AlreadyResolved { .. } => ErrorCategory::Conflict,
        StoreError::InvalidResolution { .. } => ErrorCategory::Validation,
        StoreError::Sqlite(_) | StoreError::Io(_) | StoreError::LockPoisoned => {
            ErrorCategory::Storage
        }
    }
}

impl FleetErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Settings(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::Probe(e) => e.is_recoverable(),
            Self::Invalid(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Scheduler(e) => match e {
                SchedulerError::DeviceBusy { .. }
                | SchedulerError::AlreadyAssigned { .. }
                | SchedulerError::InvalidTransition { .. } => ErrorCategory::Conflict,
                SchedulerError::EnergyThreshold { .. } => ErrorCategory::Admission,
                SchedulerError::NotFound { .. } => ErrorCategory::NotFound,
                SchedulerError::InvalidRequest(_) => ErrorCategory::Validation,
                SchedulerError::Store(inner) => store_category(inner),
            },
            Self::Settings(SettingsError::Store(inner)) => store_category(inner),
            Self::Settings(_) => ErrorCategory::Validation,
            Self::Store(e) => store_category(e),
            Self::Probe(_) => ErrorCategory::Transport,
            Self::Invalid(_) => ErrorCategory::Validation,
        }
    }
}

impl Error {
    /// Create a validation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
