//! Device state tracker
//!
//! Polls every active device, normalizes the vendor status, estimates power
//! draw and appends the reading to the bounded history. The tracker is the
//! only writer of readings and of the derived device status columns.
//!
//! Transport failures never escape a poll: an unreachable device gets a
//! synthesized offline reading and is retried on the next round.

pub mod client;
pub mod power;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::TrackerConfig;
use crate::events::{AnomalyKind, EventBus, FleetEvent, Sensor, Severity};
use crate::metrics;
use crate::models::{ConflictKind, Device, DeviceReading, DeviceStatus, JobStatus};
use crate::storage::{FleetStore, StoreResult};

pub use client::{DeviceClient, HttpDeviceClient, ProbeError, Temperatures, VendorStatus};
pub use power::{PowerModel, ThermalPowerModel};

/// Outcome of polling one device
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    Reading(DeviceReading),
    /// Query failed; the stored reading is the synthesized offline one
    Unreachable {
        reading: DeviceReading,
        reason: String,
    },
}

impl PollResult {
    pub fn reading(&self) -> &DeviceReading {
        match self {
            Self::Reading(reading) | Self::Unreachable { reading, .. } => reading,
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reading(_))
    }
}

/// Totals for one polling round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub reachable: usize,
    pub unreachable: usize,
    pub failed: usize,
}

// ============================================================================
// Device Tracker
// ============================================================================

pub struct DeviceTracker {
    store: Arc<FleetStore>,
    events: EventBus,
    client: Arc<dyn DeviceClient>,
    power_model: Arc<dyn PowerModel>,
    config: TrackerConfig,
    poll_timeout: std::time::Duration,
    /// (device, sensor) pairs currently above their limit
    breached: Mutex<HashSet<(String, Sensor)>>,
}

impl DeviceTracker {
    pub fn new(
        store: Arc<FleetStore>,
        events: EventBus,
        client: Arc<dyn DeviceClient>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            store,
            events,
            client,
            power_model: Arc::new(ThermalPowerModel::default()),
            poll_timeout: std::time::Duration::from_secs(config.poll_timeout_secs),
            config,
            breached: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the default power model
    pub fn with_power_model(mut self, model: Arc<dyn PowerModel>) -> Self {
        self.power_model = model;
        self
    }

    /// Poll one device and record the result
    pub async fn poll(&self, device: &Device) -> StoreResult<PollResult> {
        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(self.poll_timeout, self.client.query_status(device)).await {
                Ok(Ok(status)) => Ok(status),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ProbeError::Timeout),
            };
        metrics::record_poll(outcome.is_ok(), started.elapsed().as_secs_f64());

        let result = match outcome {
            Ok(status) => PollResult::Reading(self.to_reading(device, &status)),
            Err(e) => {
                tracing::debug!(device_id = %device.id, error = %e, "Device unreachable");
                PollResult::Unreachable {
                    reading: DeviceReading::offline(&device.id),
                    reason: e.to_string(),
                }
            }
        };

        let reading = result.reading();
        let append = self.store.append_reading(reading, self.config.history_cap)?;

        if append.previous_status != reading.status {
            tracing::info!(
                device_id = %device.id,
                from = %append.previous_status,
                to = %reading.status,
                "Device status changed"
            );
        }

        self.events.publish(FleetEvent::Telemetry {
            reading: reading.clone(),
        });

        if result.is_reachable() {
            self.check_thermal(device, reading);
        }

        if reading.status == DeviceStatus::Idle
            && append.idle_streak >= self.config.stale_idle_readings
        {
            if let Some(job_id) = &append.signaled_job_id {
                self.flag_stale_printing(device, job_id, append.idle_streak)?;
            }
        }

        Ok(result)
    }

    /// Poll all active devices with bounded concurrency
    pub async fn poll_all(&self) -> StoreResult<PollSummary> {
        let devices = self.store.list_devices(false)?;
        let mut summary = PollSummary {
            polled: devices.len(),
            ..PollSummary::default()
        };

        let results: Vec<_> = stream::iter(devices)
            .map(|device| async move {
                let result = self.poll(&device).await;
                (device, result)
            })
            .buffer_unordered(self.config.max_concurrent_polls.max(1))
            .collect()
            .await;

        for (device, result) in results {
            match result {
                Ok(r) if r.is_reachable() => summary.reachable += 1,
                Ok(_) => summary.unreachable += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(device_id = %device.id, error = %e, "Failed to record reading");
                }
            }
        }

        self.refresh_device_gauges()?;
        Ok(summary)
    }

    /// Polling loop; exits when `shutdown` flips to true
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = interval.as_secs(), "Device tracker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_all().await {
                        Ok(summary) => tracing::debug!(
                            polled = summary.polled,
                            reachable = summary.reachable,
                            unreachable = summary.unreachable,
                            "Polling round complete"
                        ),
                        Err(e) => tracing::error!(error = %e, "Polling round failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Device tracker stopped");
    }

    fn to_reading(&self, device: &Device, status: &VendorStatus) -> DeviceReading {
        let mapped = DeviceStatus::from_vendor(&status.state);
        let extruder = status.temperature.extruder;
        let bed = status.temperature.bed;

        DeviceReading {
            device_id: device.id.clone(),
            temperature_extruder: extruder,
            temperature_bed: bed,
            progress: status.progress.clamp(0.0, 100.0),
            status: mapped,
            fan_speed: status.fan_speed,
            power_draw_kw: self.power_model.estimate_kw(device, mapped, extruder, bed),
            recorded_at: Utc::now(),
        }
    }

    /// Edge-triggered limit check; fires once per breach and re-arms at or below the limit
    fn check_thermal(&self, device: &Device, reading: &DeviceReading) {
        let checks = [
            (Sensor::Extruder, reading.temperature_extruder, device.max_extruder_temp),
            (Sensor::Bed, reading.temperature_bed, device.max_bed_temp),
        ];

        let mut fired = Vec::new();
        {
            let Ok(mut breached) = self.breached.lock() else {
                tracing::error!("Thermal edge state lock poisoned");
                return;
            };
            for (sensor, value, limit) in checks {
                let key = (device.id.clone(), sensor);
                if value > limit {
                    if breached.insert(key) {
                        fired.push((sensor, value, limit));
                    }
                } else {
                    breached.remove(&key);
                }
            }
        }

        for (sensor, value, limit) in fired {
            tracing::warn!(
                device_id = %device.id,
                sensor = sensor.as_str(),
                value,
                limit,
                "Temperature above device limit"
            );
            metrics::record_anomaly("thermal_limit");
            self.events.publish(FleetEvent::Anomaly {
                device_id: device.id.clone(),
                kind: AnomalyKind::ThermalLimit,
                severity: Severity::Critical,
                sensor: Some(sensor),
                value: Some(value),
                limit: Some(limit),
                job_id: None,
                detail: format!(
                    "{} temperature {value:.1} exceeds limit {limit:.1}",
                    sensor.as_str()
                ),
                detected_at: reading.recorded_at,
            });
        }
    }

    fn flag_stale_printing(&self, device: &Device, job_id: &str, streak: u32) -> StoreResult<()> {
        let Some(job) = self.store.get_job(job_id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Printing {
            return Ok(());
        }

        let detail = format!("device reported idle for {streak} consecutive readings");
        let Some(conflict) = self.store.open_conflict(
            ConflictKind::StalePrinting,
            job_id,
            Some(&device.id),
            &detail,
        )?
        else {
            return Ok(());
        };

        tracing::warn!(
            device_id = %device.id,
            job_id,
            conflict_id = %conflict.id,
            "Printing job on idle device"
        );
        metrics::record_anomaly("stale_printing");
        self.events.publish(FleetEvent::Anomaly {
            device_id: device.id.clone(),
            kind: AnomalyKind::StalePrinting,
            severity: Severity::Warning,
            sensor: None,
            value: None,
            limit: None,
            job_id: Some(job_id.to_string()),
            detail,
            detected_at: conflict.detected_at,
        });
        Ok(())
    }

    fn refresh_device_gauges(&self) -> StoreResult<()> {
        let devices = self.store.list_devices(false)?;
        let statuses = [
            DeviceStatus::Offline,
            DeviceStatus::Idle,
            DeviceStatus::Printing,
            DeviceStatus::Paused,
            DeviceStatus::Error,
            DeviceStatus::Maintenance,
        ];
        let counts: Vec<_> = statuses
            .iter()
            .map(|status| {
                let count = devices
                    .iter()
                    .filter(|d| d.current_status == *status)
                    .count();
                (status.as_str(), count)
            })
            .collect();
        metrics::update_device_counts(&counts);
        Ok(())
    }
}
