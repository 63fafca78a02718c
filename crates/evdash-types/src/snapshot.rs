//! [`VehicleSnapshot`] – the canonical, complete vehicle state for one tick.
//!
//! A snapshot is never partially populated: every field carries its
//! last-known value.  [`VehicleSnapshot::baseline`] provides the values used
//! before the first tick, so a reader never observes a hole even when every
//! source is degraded from the start.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Complete point-in-time vehicle state.
///
/// Produced by the aggregator once per tick and shared behind an `Arc`; a
/// published snapshot is never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    /// Monotonic tick sequence.  The baseline snapshot is `0`.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,

    pub ambient_temp: f64,
    pub cabin_temp: f64,
    pub humidity: f64,

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

    pub gps: GpsFix,
    pub tire_pressure: TirePressure,
    pub connectivity: Connectivity,
    pub media: MediaState,
    pub settings: VehicleSettings,
    pub parking: ParkingState,

    /// Ids of sources whose last good reading is older than the staleness
    /// window.  Values for those sources are last-known, not fresh.
    #[serde(default)]
    pub stale_sources: Vec<String>,
}

impl VehicleSnapshot {
    /// The state published before the first tick completes.
    pub fn baseline(settings: VehicleSettings) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            ambient_temp: 25.0,
            cabin_temp: 22.0,
            humidity: 50.0,
            speed: 0.0,
            range_km: 300.0,
            wheel_speed: 0.0,
            efficiency_score: 8.0,
            battery_soc: 80.0,
            battery_voltage: 400.0,
            battery_current: 0.0,
            battery_soh: 97.0,
            battery_cells: BatteryCells::default(),
            motor_rpm: 0.0,
            motor_temp: 60.0,
            power_kw: 0.0,
            gps: GpsFix::default(),
            tire_pressure: TirePressure::default(),
            connectivity: Connectivity::default(),
            media: MediaState::default(),
            settings,
            parking: ParkingState::default(),
            stale_sources: Vec::new(),
        }
    }
}

impl Default for VehicleSnapshot {
    fn default() -> Self {
        Self::baseline(VehicleSettings::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Structured readings
// ─────────────────────────────────────────────────────────────────────────────

/// A positioning fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub satellites: u8,
    pub speed_gps: f64,
    /// Degrees clockwise from true north, `[0, 360)`.
    pub heading: f64,
    /// Horizontal accuracy in metres.
    pub accuracy: f64,
}

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            latitude: 28.4595,
            longitude: 77.0266,
            altitude: 240.0,
            satellites: 10,
            speed_gps: 0.0,
            heading: 0.0,
            accuracy: 5.0,
        }
    }
}

/// Tire pressures in PSI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TirePressure {
    pub front_left: f64,
    pub front_right: f64,
    pub rear_left: f64,
    pub rear_right: f64,
}

impl Default for TirePressure {
    fn default() -> Self {
        Self {
            front_left: 35.2,
            front_right: 35.1,
            rear_left: 34.9,
            rear_right: 35.0,
        }
    }
}

/// Battery cell-block temperatures in °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryCells {
    pub block_a: f64,
    pub block_b: f64,
    pub block_c: f64,
}

impl Default for BatteryCells {
    fn default() -> Self {
        Self {
            block_a: 28.5,
            block_b: 29.1,
            block_c: 29.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connectivity {
    pub wifi: bool,
    pub bluetooth: bool,
    pub can_bus: bool,
}

/// Mirrored media-player state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaState {
    pub connected: bool,
    pub device_name: String,
    pub track_title: String,
    pub track_artist: String,
    /// Track length in seconds.
    pub duration: u32,
    /// Playback position in seconds, never beyond `duration`.
    pub position: u32,
    pub is_playing: bool,
    /// Output volume, `[0.0, 1.0]`.
    pub volume: f64,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            connected: false,
            device_name: "No Device".to_string(),
            track_title: "No Track Playing".to_string(),
            track_artist: "Unknown Artist".to_string(),
            duration: 180,
            position: 0,
            is_playing: false,
            volume: 0.5,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegenLevel {
    Low,
    #[default]
    Standard,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveMode {
    #[default]
    Eco,
    Normal,
    Sport,
}

/// Rendering mode of the digital twin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwinMode {
    #[serde(rename = "2d")]
    Flat,
    #[default]
    #[serde(rename = "3d")]
    Solid,
}

/// User-adjustable settings block.  Only the command dispatcher changes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleSettings {
    /// Maximum state of charge in percent.
    pub charge_limit: u8,
    pub regen_level: RegenLevel,
    pub drive_mode: DriveMode,
    /// Screen brightness in percent.
    pub brightness: u8,
    pub light_theme: bool,
    pub predictions_on: bool,
    pub twin_mode: TwinMode,
}

impl Default for VehicleSettings {
    fn default() -> Self {
        Self {
            charge_limit: 80,
            regen_level: RegenLevel::Standard,
            drive_mode: DriveMode::Eco,
            brightness: 60,
            light_theme: false,
            predictions_on: true,
            twin_mode: TwinMode::Solid,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parking
// ─────────────────────────────────────────────────────────────────────────────

/// Proximity warning derived from a rear distance measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProximityWarning {
    /// Not reversing; the distance is last-known, not live.
    #[default]
    Inactive,
    Clear,
    Low,
    Medium,
    High,
}

impl ProximityWarning {
    /// Classify a live distance in centimetres.
    pub fn from_distance(distance_cm: f64) -> Self {
        if distance_cm <= 10.0 {
            ProximityWarning::High
        } else if distance_cm <= 20.0 {
            ProximityWarning::Medium
        } else if distance_cm <= 30.0 {
            ProximityWarning::Low
        } else {
            ProximityWarning::Clear
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proximity {
    pub distance_cm: f64,
    pub warning: ProximityWarning,
}

impl Default for Proximity {
    fn default() -> Self {
        Self {
            distance_cm: 500.0,
            warning: ProximityWarning::Inactive,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParkingState {
    pub reverse_engaged: bool,
    pub motion_detected: bool,
    pub rear_left: Proximity,
    pub rear_right: Proximity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twin_mode_uses_short_names_on_the_wire() {
        assert_eq!(serde_json::to_string(&TwinMode::Flat).unwrap(), "\"2d\"");
        assert_eq!(serde_json::to_string(&TwinMode::Solid).unwrap(), "\"3d\"");
        let back: TwinMode = serde_json::from_str("\"2d\"").unwrap();
        assert_eq!(back, TwinMode::Flat);
    }

    #[test]
    fn default_settings_match_factory_values() {
        let s = VehicleSettings::default();
        assert_eq!(s.charge_limit, 80);
        assert_eq!(s.regen_level, RegenLevel::Standard);
        assert_eq!(s.drive_mode, DriveMode::Eco);
        assert_eq!(s.brightness, 60);
        assert!(!s.light_theme);
        assert!(s.predictions_on);
        assert_eq!(s.twin_mode, TwinMode::Solid);
    }

    #[test]
    fn proximity_thresholds() {
        assert_eq!(ProximityWarning::from_distance(5.0), ProximityWarning::High);
        assert_eq!(ProximityWarning::from_distance(10.0), ProximityWarning::High);
        assert_eq!(ProximityWarning::from_distance(15.0), ProximityWarning::Medium);
        assert_eq!(ProximityWarning::from_distance(30.0), ProximityWarning::Low);
        assert_eq!(ProximityWarning::from_distance(30.1), ProximityWarning::Clear);
    }

    #[test]
    fn baseline_snapshot_is_complete() {
        let snap = VehicleSnapshot::baseline(VehicleSettings::default());
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["seq"], 0);
        assert!(json["gps"]["latitude"].is_number());
        assert_eq!(json["settings"]["twin_mode"], "3d");
        assert_eq!(json["parking"]["rear_left"]["warning"], "inactive");
        // No field is serialised as null.
        fn no_nulls(v: &serde_json::Value) -> bool {
            match v {
                serde_json::Value::Null => false,
                serde_json::Value::Object(m) => m.values().all(no_nulls),
                serde_json::Value::Array(a) => a.iter().all(no_nulls),
                _ => true,
            }
        }
        assert!(no_nulls(&json));
    }
}
