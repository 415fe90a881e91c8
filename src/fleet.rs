//! Component wiring and lifecycle
//!
//! [`FleetContext`] holds what every component shares (store, event bus,
//! configuration). [`Fleet`] builds the tracker, energy controller and
//! scheduler on top of it and drives their loops:
//!
//! ```text
//! Fleet::init(ctx) ──▶ fleet.start() ──▶ FleetHandle::shutdown()
//!                      (recover, spawn     (signal loops, join,
//!                       three loops)        drop pending starts)
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::energy::{EnergyController, HttpMeterClient, MeterClient};
use crate::error::{self, Error};
use crate::events::EventBus;
use crate::models::{Device, DeviceReading, DeviceStatus, NewDevice, QueueStatus};
use crate::scheduler::{FleetScheduler, RecoveryReport};
use crate::storage::{FleetStore, StoreError};
use crate::tracker::{DeviceClient, DeviceTracker, HttpDeviceClient};

/// Fleet counts reported by the health endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetSummary {
    pub active_devices: usize,
    pub idle_devices: usize,
    pub offline_devices: usize,
    pub queued_entries: usize,
    pub assigned_entries: usize,
    pub open_conflicts: usize,
}

/// Shared state handed to every component
#[derive(Clone)]
pub struct FleetContext {
    pub store: Arc<FleetStore>,
    pub events: EventBus,
    pub config: Arc<Config>,
}

impl FleetContext {
    /// Open the configured database and create the event bus
    pub fn init(config: Config) -> Result<Self> {
        let store = FleetStore::open(&config.database.sqlite_path).with_context(|| {
            format!(
                "Failed to open database at {}",
                config.database.sqlite_path.display()
            )
        })?;
        Ok(Self::with_store(config, store))
    }

    /// Context over an in-memory store
    pub fn in_memory(config: Config) -> Result<Self> {
        let store = FleetStore::in_memory().context("Failed to create in-memory store")?;
        Ok(Self::with_store(config, store))
    }

    fn with_store(config: Config, store: FleetStore) -> Self {
        Self {
            store: Arc::new(store),
            events: EventBus::new(config.scheduler.event_channel_capacity),
            config: Arc::new(config),
        }
    }
}

/// The three fleet components over one context
#[derive(Clone)]
pub struct Fleet {
    pub context: FleetContext,
    pub tracker: Arc<DeviceTracker>,
    pub energy: Arc<EnergyController>,
    pub scheduler: Arc<FleetScheduler>,
}

impl Fleet {
    /// Build components with the HTTP device and meter clients
    pub fn init(context: FleetContext) -> Result<Self> {
        let config = context.config.clone();
        let client = HttpDeviceClient::new(config.poll_timeout())
            .context("Failed to create device client")?;

        let meter = match &config.energy.meter_url {
            Some(url) => Some(Arc::new(
                HttpMeterClient::new(url.clone(), config.meter_timeout())
                    .context("Failed to create meter client")?,
            ) as Arc<dyn MeterClient>),
            None => None,
        };

        Ok(Self::with_clients(context, Arc::new(client), meter))
    }

    /// Build components with caller-supplied clients
    pub fn with_clients(
        context: FleetContext,
        client: Arc<dyn DeviceClient>,
        meter: Option<Arc<dyn MeterClient>>,
    ) -> Self {
        let config = &context.config;

        let tracker = Arc::new(DeviceTracker::new(
            context.store.clone(),
            context.events.clone(),
            client.clone(),
            config.tracker.clone(),
        ));

        let mut energy = EnergyController::new(
            context.store.clone(),
            context.events.clone(),
            &config.energy,
        );
        if let Some(meter) = meter {
            energy = energy.with_meter(meter);
        }
        let energy = Arc::new(energy);

        let scheduler = Arc::new(FleetScheduler::new(
            context.store.clone(),
            context.events.clone(),
            energy.clone(),
            client,
        ));

        Self {
            context,
            tracker,
            energy,
            scheduler,
        }
    }

    // ========================================================================
    // Device registry
    // ========================================================================

    /// Register a printer; it stays offline until its first successful poll
    pub fn create_device(&self, new: &NewDevice) -> error::Result<Device> {
        if new.name.trim().is_empty() {
            return Err(Error::invalid("device name must not be empty"));
        }
        if new.address.trim().is_empty() {
            return Err(Error::invalid("device address must not be empty"));
        }
        for (field, value) in [
            ("max_extruder_temp", new.max_extruder_temp),
            ("max_bed_temp", new.max_bed_temp),
            ("rated_power_kw", new.rated_power_kw),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::invalid(format!("{field} must be positive, got {value}")));
            }
        }

        let device = self.context.store.insert_device(new)?;
        tracing::info!(device_id = %device.id, name = %device.name, address = %device.address, "Device registered");
        Ok(device)
    }

    /// Soft-deactivate; history and jobs are kept
    pub fn deactivate_device(&self, id: &str) -> error::Result<Device> {
        if self.context.store.deactivate_device(id)? {
            tracing::info!(device_id = id, "Device deactivated");
        }
        self.get_device(id)
    }

    pub fn get_device(&self, id: &str) -> error::Result<Device> {
        self.context
            .store
            .get_device(id)?
            .ok_or_else(|| StoreError::not_found("device", id).into())
    }

    pub fn list_devices(&self, include_inactive: bool) -> error::Result<Vec<Device>> {
        Ok(self.context.store.list_devices(include_inactive)?)
    }

    /// Most recent readings first, at most `limit` (capped at the history size)
    pub fn get_device_history(&self, id: &str, limit: usize) -> error::Result<Vec<DeviceReading>> {
        self.get_device(id)?;
        let limit = limit.min(self.context.config.tracker.history_cap);
        Ok(self.context.store.device_history(id, limit)?)
    }

    /// Counts for the health endpoint
    pub fn summary(&self) -> error::Result<FleetSummary> {
        let devices = self.context.store.list_devices(false)?;
        let queue = self.context.store.list_queue()?;
        let open_conflicts = self.context.store.list_conflicts(true)?.len();

        Ok(FleetSummary {
            active_devices: devices.len(),
            idle_devices: devices
                .iter()
                .filter(|d| d.current_status == DeviceStatus::Idle)
                .count(),
            offline_devices: devices
                .iter()
                .filter(|d| d.current_status == DeviceStatus::Offline)
                .count(),
            queued_entries: queue
                .iter()
                .filter(|e| e.status == QueueStatus::Queued)
                .count(),
            assigned_entries: queue
                .iter()
                .filter(|e| e.status == QueueStatus::Assigned)
                .count(),
            open_conflicts,
        })
    }

    /// Run startup reconciliation, then spawn the polling, sampling and matching loops
    pub async fn start(&self) -> Result<FleetHandle> {
        let config = &self.context.config;
        let report = if config.scheduler.recover_on_start {
            self.scheduler
                .recover()
                .await
                .context("Startup reconciliation failed")?
        } else {
            RecoveryReport::default()
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(
                self.tracker
                    .clone()
                    .run(config.poll_interval(), shutdown_rx.clone()),
            ),
            tokio::spawn(
                self.energy
                    .clone()
                    .run(config.sample_interval(), shutdown_rx.clone()),
            ),
            tokio::spawn(
                self.scheduler
                    .clone()
                    .run(config.tick_interval(), shutdown_rx),
            ),
        ];

        tracing::info!("Fleet loops started");
        Ok(FleetHandle {
            shutdown_tx,
            tasks,
            recovery: report,
        })
    }
}

/// Running loops; dropping the handle without `shutdown` leaves them running
pub struct FleetHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub recovery: RecoveryReport,
}

impl FleetHandle {
    /// Signal every loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Fleet loop ended abnormally");
            }
        }
        tracing::info!("Fleet loops stopped");
    }
}
