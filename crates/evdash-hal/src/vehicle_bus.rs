//! Vehicle bus source: motor, battery, BMS and TPMS telemetry.
//!
//! The synthetic profile traces a smooth, repeating drive cycle so gauges
//! move plausibly: speed follows a slow sine, motor RPM and power track
//! speed, and state of charge drains slowly before wrapping.

use evdash_types::{BatteryCells, EvError, Reading, SourceKind, TirePressure, VehicleBusFrame};
use tracing::warn;

use crate::round_to;
use crate::source::HardwareSource;

/// A vehicle bus (CAN) interface that decodes telemetry frames.
pub trait VehicleBusDevice: Send {
    /// Return the latest decoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::HardwareFault`] when the bus is down or no frame
    /// arrived within the driver's own deadline.
    fn read_frame(&mut self) -> Result<VehicleBusFrame, EvError>;
}

const SOC_FULL: f64 = 92.0;
const SOC_DRAIN_PER_STEP: f64 = 0.01;
const SOC_CYCLE: u64 = 3000;

pub struct VehicleBus {
    id: String,
    device: Option<Box<dyn VehicleBusDevice>>,
    step: u64,
}

impl VehicleBus {
    pub fn synthetic() -> Self {
        Self {
            id: "vehicle_bus".to_string(),
            device: None,
            step: 0,
        }
    }

    /// Synthetic cycle positioned so the first frame reports roughly
    /// `battery_soc`.
    pub fn synthetic_from_soc(battery_soc: f64) -> Self {
        let drained = ((SOC_FULL - battery_soc) / SOC_DRAIN_PER_STEP)
            .round()
            .clamp(0.0, (SOC_CYCLE - 1) as f64) as u64;
        Self {
            step: drained.saturating_sub(1),
            ..Self::synthetic()
        }
    }

    pub fn with_device(device: Box<dyn VehicleBusDevice>) -> Self {
        Self {
            device: Some(device),
            ..Self::synthetic()
        }
    }

    fn synthetic_frame(&mut self) -> VehicleBusFrame {
        let t = self.step as f64;
        self.step += 1;

        let speed = (60.0 + 55.0 * (t / 20.0).sin()).clamp(0.0, 120.0);
        let accel = (t / 20.0).cos();
        let power_kw = (speed * 0.6 + 8.0 * (t / 7.0).sin()).clamp(0.0, 100.0);
        let soc = SOC_FULL - (self.step % SOC_CYCLE) as f64 * SOC_DRAIN_PER_STEP;
        let voltage = 380.0 + (soc - 60.0) * (40.0 / 35.0);
        // Regenerative braking shows up as negative current while slowing.
        let current = if accel < -0.3 {
            -power_kw * 1000.0 / voltage * 0.5
        } else {
            power_kw * 1000.0 / voltage
        };
        let heat = power_kw / 100.0;

        VehicleBusFrame {
            speed: round_to(speed, 1),
            range_km: round_to(soc * 3.5, 0),
            wheel_speed: round_to(speed * 0.4, 0),
            efficiency_score: round_to((9.5 - speed / 48.0).clamp(7.0, 9.5), 1),
            battery_soc: round_to(soc, 1),
            battery_voltage: round_to(voltage, 1),
            battery_current: round_to(current, 1),
            battery_soh: 97.0,
            battery_cells: BatteryCells {
                block_a: round_to(28.5 + heat * 2.0, 1),
                block_b: round_to(29.1 + heat * 2.2, 1),
                block_c: round_to(29.0 + heat * 2.1, 1),
            },
            motor_rpm: round_to(speed * 66.0, 0),
            motor_temp: round_to(60.0 + speed * 0.29, 1),
            power_kw: round_to(power_kw, 1),
            tire_pressure: TirePressure {
                front_left: round_to(35.2 + 0.1 * (t / 30.0).sin(), 1),
                front_right: round_to(35.1 + 0.1 * (t / 31.0).sin(), 1),
                rear_left: round_to(34.9 + 0.1 * (t / 29.0).sin(), 1),
                rear_right: round_to(35.0 + 0.1 * (t / 32.0).sin(), 1),
            },
            can_online: false,
            wifi: true,
        }
    }
}

impl HardwareSource for VehicleBus {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::VehicleBus
    }

    fn is_synthetic(&self) -> bool {
        self.device.is_none()
    }

    fn poll(&mut self) -> Reading {
        let Some(device) = self.device.as_mut() else {
            return Reading::VehicleBus(self.synthetic_frame());
        };
        match device.read_frame() {
            Ok(frame) => Reading::VehicleBus(frame),
            Err(e) => {
                warn!(source = %self.id, error = %e, "vehicle bus read failed");
                Reading::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }
}
