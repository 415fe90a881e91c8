//! Common test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use printfleet::config::Config;
use printfleet::energy::MeterClient;
use printfleet::fleet::{Fleet, FleetContext};
use printfleet::models::{Device, DeviceReading, DeviceStatus, NewDevice, WorkUnit};
use printfleet::tracker::{DeviceClient, ProbeError, Temperatures, VendorStatus};

/// One start signal seen by [`RecordingClient`]
#[derive(Debug, Clone)]
pub struct StartCall {
    pub device_id: String,
    pub job_id: String,
    pub at: tokio::time::Instant,
}

/// Device client that reports every device idle and records start signals
#[derive(Default)]
pub struct RecordingClient {
    starts: Mutex<Vec<StartCall>>,
}

impl RecordingClient {
    pub fn starts(&self) -> Vec<StartCall> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceClient for RecordingClient {
    async fn query_status(&self, _device: &Device) -> Result<VendorStatus, ProbeError> {
        Ok(VendorStatus {
            state: "idle".to_string(),
            temperature: Temperatures {
                extruder: 25.0,
                bed: 25.0,
            },
            progress: 0.0,
            fan_speed: 0.0,
        })
    }

    async fn start_job(&self, device: &Device, job: &WorkUnit) -> Result<(), ProbeError> {
        self.starts.lock().unwrap().push(StartCall {
            device_id: device.id.clone(),
            job_id: job.id.clone(),
            at: tokio::time::Instant::now(),
        });
        Ok(())
    }
}

/// Meter with an operator-set value
pub struct FixedMeter {
    kw: Mutex<f64>,
}

impl FixedMeter {
    pub fn new(kw: f64) -> Self {
        Self { kw: Mutex::new(kw) }
    }

    pub fn set(&self, kw: f64) {
        *self.kw.lock().unwrap() = kw;
    }
}

#[async_trait]
impl MeterClient for FixedMeter {
    async fn read_kw(&self) -> Result<f64, ProbeError> {
        Ok(*self.kw.lock().unwrap())
    }
}

/// In-memory fleet with a recording device client and a fixed meter
pub fn test_fleet(meter_kw: f64) -> (Fleet, Arc<RecordingClient>, Arc<FixedMeter>) {
    let context = FleetContext::in_memory(Config::default()).unwrap();
    let client = Arc::new(RecordingClient::default());
    let meter = Arc::new(FixedMeter::new(meter_kw));
    let fleet = Fleet::with_clients(context, client.clone(), Some(meter.clone()));
    (fleet, client, meter)
}

/// Register a device and record one reading with the given status
pub fn device_with_status(fleet: &Fleet, name: &str, status: DeviceStatus) -> Device {
    let device = fleet
        .create_device(&NewDevice::new(name, format!("{name}.local:8080")))
        .unwrap();
    record_status(fleet, &device.id, status);
    fleet.get_device(&device.id).unwrap()
}

pub fn idle_device(fleet: &Fleet, name: &str) -> Device {
    device_with_status(fleet, name, DeviceStatus::Idle)
}

pub fn record_status(fleet: &Fleet, device_id: &str, status: DeviceStatus) {
    let reading = DeviceReading {
        device_id: device_id.to_string(),
        temperature_extruder: 25.0,
        temperature_bed: 25.0,
        progress: 0.0,
        status,
        fan_speed: 0.0,
        power_draw_kw: 0.02,
        recorded_at: Utc::now(),
    };
    fleet
        .context
        .store
        .append_reading(&reading, fleet.context.config.tracker.history_cap)
        .unwrap();
}
