//! [`Reading`] – what a hardware source yields on one poll.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::{BatteryCells, GpsFix, MediaState, ParkingState, TirePressure};

/// The closed set of hardware source variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Temperature/humidity sensor.
    Climate,
    /// Motor and battery telemetry from the vehicle bus.
    VehicleBus,
    /// Positioning module.
    Gnss,
    /// Bluetooth media controller.
    Media,
    /// Rear ultrasonic sensors, reverse switch and motion detector.
    Parking,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Climate => "climate",
            SourceKind::VehicleBus => "vehicle_bus",
            SourceKind::Gnss => "gnss",
            SourceKind::Media => "media",
            SourceKind::Parking => "parking",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One climate sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateSample {
    pub ambient_temp: f64,
    pub humidity: f64,
    /// `None` when no dedicated cabin sensor is fitted.
    pub cabin_temp: Option<f64>,
}

/// One frame of motor/battery telemetry decoded from the vehicle bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleBusFrame {
    pub speed: f64,
    pub range_km: f64,
    pub wheel_speed: f64,
    pub efficiency_score: f64,
    pub battery_soc: f64,
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub battery_soh: f64,
    pub battery_cells: BatteryCells,
    pub motor_rpm: f64,
    pub motor_temp: f64,
    pub power_kw: f64,
    pub tire_pressure: TirePressure,
    /// Whether frames are arriving from a physical bus.
    pub can_online: bool,
    /// Telematics-unit WiFi link state.
    pub wifi: bool,
}

/// The result of polling a single hardware source.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Climate(ClimateSample),
    VehicleBus(VehicleBusFrame),
    Gps(GpsFix),
    Media(MediaState),
    Parking(ParkingState),
    /// The source could not produce a sample this poll.  The caller keeps
    /// the previous values for every field the source owns.
    Degraded { reason: String },
}

impl Reading {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Reading::Degraded { .. })
    }
}
