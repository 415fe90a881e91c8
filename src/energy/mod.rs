//! Energy admission controller
//!
//! Samples aggregate fleet load on a fixed interval and answers the single
//! admission question every assignment path asks before committing work.
//!
//! # Load source
//!
//! ```text
//! meter configured and answering  -> meter value           (source = meter)
//! otherwise                       -> base_load_kw + sum of
//!                                    active devices' draw  (source = estimate)
//! ```
//!
//! # Gate
//!
//! With peak protection on, an assignment is refused when the latest sample
//! is at or above `max_load_kw * 0.9`. Each refusal is logged as a
//! [`PowerEvent`].

pub mod meter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::EnergyConfig;
use crate::events::{EventBus, FleetEvent};
use crate::metrics;
use crate::models::{EnergyReading, EnergySettings, LoadSource, PowerEvent, PowerEventKind};
use crate::storage::{FleetStore, StoreError, StoreResult};

pub use meter::{HttpMeterClient, MeterClient};

/// Share of `max_load_kw` at which admission closes
pub const ADMISSION_FACTOR: f64 = 0.9;

/// Admission threshold for a settings row
pub fn threshold_kw(settings: &EnergySettings) -> f64 {
    settings.max_load_kw * ADMISSION_FACTOR
}

// ============================================================================
// Admission and state
// ============================================================================

/// Gate decision
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed,
    Blocked {
        reading: EnergyReading,
        threshold_kw: f64,
        reason: String,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Snapshot returned to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyState {
    pub settings: EnergySettings,
    pub latest: Option<EnergyReading>,
    pub threshold_kw: f64,
    /// `threshold_kw - latest.current_kw`, when a sample exists
    pub headroom_kw: Option<f64>,
    /// Whether the gate would refuse an assignment right now
    pub admission_open: bool,
}

/// Partial settings update; absent fields keep their current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub max_load_kw: Option<f64>,
    pub peak_protection_enabled: Option<bool>,
    pub stagger_enabled: Option<bool>,
    pub stagger_delay_secs: Option<i64>,
    pub base_load_kw: Option<f64>,
}

impl SettingsUpdate {
    pub fn apply(&self, current: &EnergySettings) -> EnergySettings {
        EnergySettings {
            max_load_kw: self.max_load_kw.unwrap_or(current.max_load_kw),
            peak_protection_enabled: self
                .peak_protection_enabled
                .unwrap_or(current.peak_protection_enabled),
            stagger_enabled: self.stagger_enabled.unwrap_or(current.stagger_enabled),
            stagger_delay_secs: self.stagger_delay_secs.unwrap_or(current.stagger_delay_secs),
            base_load_kw: self.base_load_kw.unwrap_or(current.base_load_kw),
        }
    }
}

/// Rejections at the settings boundary
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("max_load_kw must be a positive number, got {0}")]
    InvalidMaxLoad(f64),

    #[error("base_load_kw must be zero or more, got {0}")]
    InvalidBaseLoad(f64),

    #[error("stagger_delay_secs must be positive, got {0}")]
    InvalidStaggerDelay(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SettingsError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// Reject out-of-range settings without clamping
pub fn validate_settings(settings: &EnergySettings) -> Result<(), SettingsError> {
    if !settings.max_load_kw.is_finite() || settings.max_load_kw <= 0.0 {
        return Err(SettingsError::InvalidMaxLoad(settings.max_load_kw));
    }
    if !settings.base_load_kw.is_finite() || settings.base_load_kw < 0.0 {
        return Err(SettingsError::InvalidBaseLoad(settings.base_load_kw));
    }
    if settings.stagger_delay_secs <= 0 {
        return Err(SettingsError::InvalidStaggerDelay(settings.stagger_delay_secs));
    }
    Ok(())
}

// ============================================================================
// Energy Controller
// ============================================================================

pub struct EnergyController {
    store: Arc<FleetStore>,
    events: EventBus,
    meter: Option<Arc<dyn MeterClient>>,
    meter_timeout: Duration,
    history_cap: usize,
    /// Set while samples stay at or above the threshold
    breach_active: AtomicBool,
}

impl EnergyController {
    pub fn new(store: Arc<FleetStore>, events: EventBus, config: &EnergyConfig) -> Self {
        Self {
            store,
            events,
            meter: None,
            meter_timeout: Duration::from_secs(config.meter_timeout_secs),
            history_cap: config.history_cap,
            breach_active: AtomicBool::new(false),
        }
    }

    pub fn with_meter(mut self, meter: Arc<dyn MeterClient>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn settings(&self) -> StoreResult<EnergySettings> {
        self.store.energy_settings()
    }

    /// Take and persist one load sample
    pub async fn sample(&self) -> StoreResult<EnergyReading> {
        let settings = self.store.energy_settings()?;
        let fleet = self.store.fleet_load()?;
        let estimate = settings.base_load_kw + fleet.devices_kw;

        let (current_kw, source) = match &self.meter {
            Some(meter) => match tokio::time::timeout(self.meter_timeout, meter.read_kw()).await {
                Ok(Ok(kw)) => (kw, LoadSource::Meter),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Meter read failed, using device estimate");
                    (estimate, LoadSource::Estimate)
                }
                Err(_) => {
                    tracing::warn!("Meter read timed out, using device estimate");
                    (estimate, LoadSource::Estimate)
                }
            },
            None => (estimate, LoadSource::Estimate),
        };

        let reading = EnergyReading {
            current_kw,
            max_kw: settings.max_load_kw,
            active_device_count: fleet.active_device_count,
            source,
            recorded_at: Utc::now(),
        };
        self.store.insert_energy_reading(&reading, self.history_cap)?;

        let threshold = threshold_kw(&settings);
        metrics::update_load(current_kw, threshold);
        self.events.publish(FleetEvent::EnergySample {
            reading: reading.clone(),
        });

        self.track_breach(&settings, &reading, threshold)?;
        Ok(reading)
    }

    /// Latest sample, sampling once if none exists yet
    pub async fn current_load(&self) -> StoreResult<EnergyReading> {
        match self.store.latest_energy_reading()? {
            Some(reading) => Ok(reading),
            None => self.sample().await,
        }
    }

    /// The admission gate shared by the matching tick and manual assignment
    pub async fn check_admission(&self) -> StoreResult<Admission> {
        let settings = self.store.energy_settings()?;
        if !settings.peak_protection_enabled {
            metrics::record_admission(true);
            return Ok(Admission::Allowed);
        }

        let reading = self.current_load().await?;
        let threshold = threshold_kw(&settings);

        if reading.current_kw < threshold {
            metrics::record_admission(true);
            return Ok(Admission::Allowed);
        }

        let reason = format!(
            "load {:.2} kW is at or above {:.0}% of the {:.2} kW limit",
            reading.current_kw,
            ADMISSION_FACTOR * 100.0,
            settings.max_load_kw
        );
        let event = PowerEvent {
            kind: PowerEventKind::AdmissionBlocked,
            current_kw: reading.current_kw,
            limit_kw: settings.max_load_kw,
            threshold_kw: threshold,
            reason: reason.clone(),
            created_at: Utc::now(),
        };
        self.store.insert_power_event(&event)?;
        self.events.publish(FleetEvent::Power { event });
        metrics::record_admission(false);

        tracing::warn!(
            current_kw = reading.current_kw,
            threshold_kw = threshold,
            "Admission blocked"
        );

        Ok(Admission::Blocked {
            reading,
            threshold_kw: threshold,
            reason,
        })
    }

    /// Validate and persist new settings
    pub fn update_settings(&self, settings: EnergySettings) -> Result<EnergySettings, SettingsError> {
        validate_settings(&settings)?;
        self.store.save_energy_settings(&settings)?;

        tracing::info!(
            max_load_kw = settings.max_load_kw,
            peak_protection = settings.peak_protection_enabled,
            stagger = settings.stagger_enabled,
            stagger_delay_secs = settings.stagger_delay_secs,
            base_load_kw = settings.base_load_kw,
            "Energy settings updated"
        );
        Ok(settings)
    }

    /// Apply a partial update on top of the stored settings
    pub fn patch_settings(&self, update: &SettingsUpdate) -> Result<EnergySettings, SettingsError> {
        let current = self.store.energy_settings()?;
        self.update_settings(update.apply(&current))
    }

    pub fn get_energy_state(&self) -> StoreResult<EnergyState> {
        let settings = self.store.energy_settings()?;
        let latest = self.store.latest_energy_reading()?;
        let threshold = threshold_kw(&settings);
        let headroom_kw = latest.as_ref().map(|r| threshold - r.current_kw);
        let admission_open = !settings.peak_protection_enabled
            || latest.as_ref().map_or(true, |r| r.current_kw < threshold);

        Ok(EnergyState {
            settings,
            latest,
            threshold_kw: threshold,
            headroom_kw,
            admission_open,
        })
    }

    pub fn energy_history(&self, limit: usize) -> StoreResult<Vec<EnergyReading>> {
        self.store.energy_history(limit)
    }

    pub fn list_power_events(&self, limit: usize) -> StoreResult<Vec<PowerEvent>> {
        self.store.list_power_events(limit)
    }

    /// Sampling loop; exits when `shutdown` flips to true
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = interval.as_secs(), "Energy sampler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample().await {
                        tracing::error!(error = %e, "Load sample failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Energy sampler stopped");
    }

    /// Log one threshold_breach per excursion above the threshold
    fn track_breach(
        &self,
        settings: &EnergySettings,
        reading: &EnergyReading,
        threshold: f64,
    ) -> StoreResult<()> {
        let above = settings.peak_protection_enabled && reading.current_kw >= threshold;
        let was_above = self.breach_active.swap(above, Ordering::SeqCst);
        if !above || was_above {
            return Ok(());
        }

        let event = PowerEvent {
            kind: PowerEventKind::ThresholdBreach,
            current_kw: reading.current_kw,
            limit_kw: settings.max_load_kw,
            threshold_kw: threshold,
            reason: format!(
                "{} sample {:.2} kW crossed the admission threshold",
                reading.source.as_str(),
                reading.current_kw
            ),
            created_at: reading.recorded_at,
        };
        self.store.insert_power_event(&event)?;
        self.events.publish(FleetEvent::Power { event });
        tracing::warn!(
            current_kw = reading.current_kw,
            threshold_kw = threshold,
            "Fleet load crossed admission threshold"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceReading, DeviceStatus, NewDevice};

    fn controller() -> (EnergyController, Arc<FleetStore>) {
        let store = Arc::new(FleetStore::in_memory().unwrap());
        let controller =
            EnergyController::new(store.clone(), EventBus::new(16), &EnergyConfig::default());
        (controller, store)
    }

    fn set_device_draw(store: &FleetStore, kw: f64) {
        let device = store.insert_device(&NewDevice::new("p", "127.0.0.1:1")).unwrap();
        let reading = DeviceReading {
            device_id: device.id,
            temperature_extruder: 200.0,
            temperature_bed: 60.0,
            progress: 10.0,
            status: DeviceStatus::Printing,
            fan_speed: 100.0,
            power_draw_kw: kw,
            recorded_at: Utc::now(),
        };
        store.append_reading(&reading, 10).unwrap();
    }

    #[test]
    fn test_validate_settings() {
        let ok = EnergySettings::default();
        assert!(validate_settings(&ok).is_ok());

        let bad = EnergySettings {
            stagger_delay_secs: 0,
            ..ok.clone()
        };
        assert!(matches!(
            validate_settings(&bad),
            Err(SettingsError::InvalidStaggerDelay(0))
        ));

        let bad = EnergySettings {
            max_load_kw: 0.0,
            ..ok.clone()
        };
        assert!(matches!(validate_settings(&bad), Err(SettingsError::InvalidMaxLoad(_))));

        let bad = EnergySettings {
            base_load_kw: -0.1,
            ..ok
        };
        assert!(matches!(validate_settings(&bad), Err(SettingsError::InvalidBaseLoad(_))));
    }

    #[tokio::test]
    async fn test_estimate_sums_base_and_devices() {
        let (controller, store) = controller();
        set_device_draw(&store, 1.25);
        set_device_draw(&store, 0.75);

        let reading = controller.sample().await.unwrap();
        assert_eq!(reading.source, LoadSource::Estimate);
        assert!((reading.current_kw - 2.5).abs() < 1e-9);
        assert_eq!(reading.active_device_count, 2);
    }

    #[tokio::test]
    async fn test_blocked_at_ninety_percent() {
        let (controller, store) = controller();
        // 0.5 base + 5.0 devices = 5.5 kW against a 5.4 kW threshold
        set_device_draw(&store, 5.0);
        controller.sample().await.unwrap();

        match controller.check_admission().await.unwrap() {
            Admission::Blocked {
                reading,
                threshold_kw,
                ..
            } => {
                assert!((reading.current_kw - 5.5).abs() < 1e-9);
                assert!((threshold_kw - 5.4).abs() < 1e-9);
            }
            Admission::Allowed => panic!("expected blocked admission"),
        }

        let events = controller.list_power_events(10).unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == PowerEventKind::AdmissionBlocked && e.limit_kw == 6.0));
    }

    #[tokio::test]
    async fn test_protection_disabled_allows() {
        let (controller, store) = controller();
        set_device_draw(&store, 10.0);
        controller
            .update_settings(EnergySettings {
                peak_protection_enabled: false,
                ..EnergySettings::default()
            })
            .unwrap();

        assert!(controller.check_admission().await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_breach_event_once_per_excursion() {
        let (controller, store) = controller();
        set_device_draw(&store, 5.0);
        controller.sample().await.unwrap();
        controller.sample().await.unwrap();

        let breaches = controller
            .list_power_events(10)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == PowerEventKind::ThresholdBreach)
            .count();
        assert_eq!(breaches, 1);
    }

    #[tokio::test]
    async fn test_admission_samples_when_empty() {
        let (controller, store) = controller();
        assert!(store.latest_energy_reading().unwrap().is_none());
        assert!(controller.check_admission().await.unwrap().is_allowed());
        assert_eq!(store.energy_reading_count().unwrap(), 1);
    }

    #[test]
    fn test_patch_keeps_unset_fields() {
        let (controller, _) = controller();
        let updated = controller
            .patch_settings(&SettingsUpdate {
                max_load_kw: Some(8.0),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert_eq!(updated.max_load_kw, 8.0);
        assert_eq!(updated.stagger_delay_secs, 30);

        let rejected = controller.patch_settings(&SettingsUpdate {
            stagger_delay_secs: Some(-5),
            ..SettingsUpdate::default()
        });
        assert!(rejected.is_err());
        assert_eq!(controller.settings().unwrap().max_load_kw, 8.0);
    }
}
