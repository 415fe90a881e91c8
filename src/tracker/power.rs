//! Per-device power draw estimation

use crate::models::{Device, DeviceStatus};

/// Estimates a device's draw in kW from one telemetry snapshot.
///
/// Implementations must be non-decreasing in both temperatures.
pub trait PowerModel: Send + Sync {
    fn estimate_kw(
        &self,
        device: &Device,
        status: DeviceStatus,
        extruder_c: f64,
        bed_c: f64,
    ) -> f64;
}

/// Heater-driven model: a standby floor plus shares of the rated power that
/// scale with how far each heater is above ambient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalPowerModel {
    pub ambient_c: f64,
    pub standby_share: f64,
    pub extruder_share: f64,
    pub bed_share: f64,
}

impl Default for ThermalPowerModel {
    fn default() -> Self {
        Self {
            ambient_c: 25.0,
            standby_share: 0.05,
            extruder_share: 0.35,
            bed_share: 0.60,
        }
    }
}

impl ThermalPowerModel {
    /// Fraction of the heater range in use, clamped to [0, 1]
    fn heat_fraction(&self, temp_c: f64, max_c: f64) -> f64 {
        let span = max_c - self.ambient_c;
        if span <= 0.0 || !temp_c.is_finite() {
            return 0.0;
        }
        ((temp_c - self.ambient_c) / span).clamp(0.0, 1.0)
    }
}

impl PowerModel for ThermalPowerModel {
    fn estimate_kw(
        &self,
        device: &Device,
        status: DeviceStatus,
        extruder_c: f64,
        bed_c: f64,
    ) -> f64 {
        if status == DeviceStatus::Offline {
            return 0.0;
        }

        let share = self.standby_share
            + self.extruder_share * self.heat_fraction(extruder_c, device.max_extruder_temp)
            + self.bed_share * self.heat_fraction(bed_c, device.max_bed_temp);

        device.rated_power_kw.max(0.0) * share
    }
}
