//! printfleet - Printer fleet scheduling with energy admission control
//!
//! Tracks a fleet of networked printers, matches queued jobs to idle
//! devices, and holds back new work while fleet power draw is near the
//! configured limit.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`tracker`] - Device polling, status mapping and anomaly detection
//! - [`energy`] - Load sampling, admission gate and energy settings
//! - [`scheduler`] - Queue matching, manual assignment and recovery
//! - [`storage`] - SQLite persistence
//! - [`events`] - In-process event bus
//! - [`fleet`] - Component wiring and lifecycle
//! - [`server`] - REST API and event stream
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and types
//!
//! # Example
//!
//! ```no_run
//! use printfleet::config::Config;
//! use printfleet::fleet::{Fleet, FleetContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let fleet = Fleet::init(FleetContext::init(config)?)?;
//!     let handle = fleet.start().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod energy;
pub mod error;
pub mod events;
pub mod fleet;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod tracker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::energy::{Admission, EnergyController, EnergyState, SettingsUpdate};
    pub use crate::error::{Error, ErrorCategory, FleetErrorTrait, Result};
    pub use crate::events::{EventBus, FleetEvent};
    pub use crate::fleet::{Fleet, FleetContext, FleetHandle};
    pub use crate::models::{
        Device, DeviceReading, DeviceStatus, EnergyReading, EnergySettings, JobStatus,
        NewDevice, NewWorkUnit, Priority, QueueEntry, WorkUnit,
    };
    pub use crate::scheduler::{FleetScheduler, TickOutcome};
    pub use crate::storage::FleetStore;
    pub use crate::tracker::DeviceTracker;
}

// Direct re-exports for convenience
pub use models::{Device, DeviceStatus, JobStatus, Priority, QueueEntry, WorkUnit};
