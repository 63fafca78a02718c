//! Positioning module source.
//!
//! Without a receiver the module drives along a fixed six-waypoint route,
//! easing 10 % of the remaining distance towards the current waypoint on
//! every poll and advancing to the next waypoint every ten polls.
//!
//! A fix injected with `update_gps` is reported verbatim until another
//! injection replaces it or a physical receiver produces a fix of its own.

use evdash_types::{Command, EvError, GpsFix, GpsUpdate, Reading, SourceKind};
use tracing::{debug, warn};

use crate::round_to;
use crate::source::{Ack, HardwareSource};

const ROUTE: [(f64, f64); 6] = [
    (28.4595, 77.0266),
    (28.4605, 77.0276),
    (28.4615, 77.0286),
    (28.4625, 77.0296),
    (28.4635, 77.0306),
    (28.4645, 77.0316),
];
const POLLS_PER_WAYPOINT: u64 = 10;
const EASING: f64 = 0.1;
const METRES_PER_DEGREE: f64 = 111_320.0;

/// A GNSS receiver driver.
pub trait GnssDevice: Send {
    /// # Errors
    ///
    /// Returns [`EvError::HardwareFault`] when no valid fix is available.
    fn read_fix(&mut self) -> Result<GpsFix, EvError>;
}

pub struct GnssModule {
    id: String,
    device: Option<Box<dyn GnssDevice>>,
    position: (f64, f64),
    step: u64,
    injected: Option<GpsFix>,
    last: GpsFix,
}

impl GnssModule {
    pub fn synthetic() -> Self {
        Self {
            id: "gnss".to_string(),
            device: None,
            position: ROUTE[0],
            step: 0,
            injected: None,
            last: GpsFix::default(),
        }
    }

    pub fn with_device(device: Box<dyn GnssDevice>) -> Self {
        Self {
            device: Some(device),
            ..Self::synthetic()
        }
    }

    fn synthetic_fix(&mut self) -> GpsFix {
        let index = ((self.step / POLLS_PER_WAYPOINT) as usize) % ROUTE.len();
        let (target_lat, target_lon) = ROUTE[index];
        let (lat, lon) = self.position;
        let next = (
            lat + (target_lat - lat) * EASING,
            lon + (target_lon - lon) * EASING,
        );
        self.position = next;
        self.step += 1;

        let d_north = (next.0 - lat) * METRES_PER_DEGREE;
        let d_east = (next.1 - lon) * METRES_PER_DEGREE * lat.to_radians().cos();
        let moved = d_north.hypot(d_east);
        let heading = if moved > 0.01 {
            d_east.atan2(d_north).to_degrees().rem_euclid(360.0)
        } else {
            self.last.heading
        };

        GpsFix {
            latitude: round_to(next.0, 6),
            longitude: round_to(next.1, 6),
            altitude: round_to(240.0 + 5.0 * (self.step as f64 / 10.0).sin(), 1),
            satellites: 8 + ((self.step / 7) % 5) as u8,
            // One poll per second: metres moved per poll → km/h.
            speed_gps: round_to(moved * 3.6, 1),
            heading: round_to(heading, 1),
            accuracy: 5.0,
        }
    }

    fn inject(&mut self, update: &GpsUpdate) -> GpsFix {
        GpsFix {
            latitude: update.latitude,
            longitude: update.longitude,
            altitude: update.altitude.unwrap_or(self.last.altitude),
            satellites: self.last.satellites,
            speed_gps: update.speed.unwrap_or(self.last.speed_gps),
            heading: update.heading.unwrap_or(self.last.heading),
            accuracy: update.accuracy.unwrap_or(self.last.accuracy),
        }
    }
}

impl HardwareSource for GnssModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Gnss
    }

    fn is_synthetic(&self) -> bool {
        self.device.is_none()
    }

    fn poll(&mut self) -> Reading {
        let fix = match self.device.as_mut() {
            Some(device) => match device.read_fix() {
                Ok(fix) => {
                    self.injected = None;
                    fix
                }
                Err(e) => match &self.injected {
                    Some(fix) => fix.clone(),
                    None => {
                        warn!(source = %self.id, error = %e, "no GNSS fix");
                        return Reading::Degraded {
                            reason: e.to_string(),
                        };
                    }
                },
            },
            None => match &self.injected {
                Some(fix) => fix.clone(),
                None => self.synthetic_fix(),
            },
        };
        self.last = fix.clone();
        Reading::Gps(fix)
    }

    fn apply(&mut self, command: &Command) -> Result<Ack, EvError> {
        let Command::UpdateGps(update) = command else {
            return Err(EvError::Rejected(format!(
                "source '{}' does not accept {}",
                self.id,
                command.action()
            )));
        };
        let fix = self.inject(update);
        debug!(lat = fix.latitude, lon = fix.longitude, "external fix injected");
        self.last = fix.clone();
        self.injected = Some(fix);
        Ok(Ack::Mirrored)
    }
}
