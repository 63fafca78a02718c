//! Rear parking assist: two ultrasonic rangers, a PIR motion sensor and the
//! reverse-gear input.
//!
//! Distances are only measured while reverse is engaged. Outside reverse the
//! last measured distance is kept and the warning reads `inactive`.

use evdash_types::{EvError, ParkingState, Proximity, ProximityWarning, Reading, SourceKind};
use tracing::warn;

use crate::round_to;
use crate::source::HardwareSource;

const POLLS_PER_PHASE: u64 = 5;
const RIGHT_SENSOR_OFFSET_CM: f64 = 5.0;

/// One raw read of the parking hardware.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParkingFrame {
    pub reverse_engaged: bool,
    pub motion_detected: bool,
    /// `None` when the ranger timed out or returned an implausible echo.
    pub rear_left_cm: Option<f64>,
    pub rear_right_cm: Option<f64>,
}

pub trait ParkingDevice: Send {
    /// # Errors
    ///
    /// Returns [`EvError::HardwareFault`] when the GPIO lines cannot be read.
    fn read(&mut self) -> Result<ParkingFrame, EvError>;
}

pub struct ParkingModule {
    id: String,
    device: Option<Box<dyn ParkingDevice>>,
    state: ParkingState,
    step: u64,
}

impl ParkingModule {
    pub fn synthetic() -> Self {
        Self {
            id: "parking".to_string(),
            device: None,
            state: ParkingState::default(),
            step: 0,
        }
    }

    pub fn with_device(device: Box<dyn ParkingDevice>) -> Self {
        Self {
            device: Some(device),
            ..Self::synthetic()
        }
    }

    // Cycles clear → low → medium → high, five polls per phase. Reverse is
    // engaged during the medium and high phases.
    fn synthetic_frame(&mut self) -> ParkingFrame {
        let phase = (self.step / POLLS_PER_PHASE) % 4;
        let frac = (self.step % POLLS_PER_PHASE) as f64 / (POLLS_PER_PHASE - 1) as f64;
        let motion_tick = self.step % 7 == 0;
        self.step += 1;

        let (lo, hi) = match phase {
            0 => (35.0, 55.0),
            1 => (22.0, 30.0),
            2 => (12.0, 19.0),
            _ => (5.0, 9.0),
        };
        let left = round_to(lo + (hi - lo) * frac, 1);
        let reverse = matches!(phase, 2 | 3);

        ParkingFrame {
            reverse_engaged: reverse,
            motion_detected: reverse && motion_tick,
            rear_left_cm: reverse.then_some(left),
            rear_right_cm: reverse.then_some(left + RIGHT_SENSOR_OFFSET_CM),
        }
    }

    fn merge(&mut self, frame: ParkingFrame) -> ParkingState {
        self.state.reverse_engaged = frame.reverse_engaged;
        self.state.motion_detected = frame.motion_detected;
        update_side(
            &mut self.state.rear_left,
            frame.reverse_engaged,
            frame.rear_left_cm,
        );
        update_side(
            &mut self.state.rear_right,
            frame.reverse_engaged,
            frame.rear_right_cm,
        );
        self.state.clone()
    }
}

fn update_side(side: &mut Proximity, reverse: bool, measured: Option<f64>) {
    match (reverse, measured) {
        (true, Some(cm)) => {
            side.distance_cm = cm;
            side.warning = ProximityWarning::from_distance(cm);
        }
        _ => side.warning = ProximityWarning::Inactive,
    }
}

impl HardwareSource for ParkingModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Parking
    }

    fn is_synthetic(&self) -> bool {
        self.device.is_none()
    }

    fn poll(&mut self) -> Reading {
        let frame = match self.device.as_mut() {
            None => self.synthetic_frame(),
            Some(device) => match device.read() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(source = %self.id, error = %e, "parking sensors unreadable");
                    return Reading::Degraded {
                        reason: e.to_string(),
                    };
                }
            },
        };
        Reading::Parking(self.merge(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parking(module: &mut ParkingModule) -> ParkingState {
        match module.poll() {
            Reading::Parking(p) => p,
            other => panic!("expected parking, got {other:?}"),
        }
    }

    #[test]
    fn idle_phases_report_inactive() {
        let mut m = ParkingModule::synthetic();
        for _ in 0..10 {
            let p = parking(&mut m);
            assert!(!p.reverse_engaged);
            assert!(!p.motion_detected);
            assert_eq!(p.rear_left.warning, ProximityWarning::Inactive);
            assert_eq!(p.rear_left.distance_cm, 500.0);
        }
    }

    #[test]
    fn reverse_phases_escalate_warnings() {
        let mut m = ParkingModule::synthetic();
        for _ in 0..10 {
            m.poll();
        }
        let medium = parking(&mut m);
        assert!(medium.reverse_engaged);
        assert_eq!(medium.rear_left.warning, ProximityWarning::Medium);
        assert_eq!(
            medium.rear_right.distance_cm,
            medium.rear_left.distance_cm + RIGHT_SENSOR_OFFSET_CM
        );

        for _ in 0..4 {
            m.poll();
        }
        let high = parking(&mut m);
        assert_eq!(high.rear_left.warning, ProximityWarning::High);
    }

    #[test]
    fn distance_is_retained_after_leaving_reverse() {
        let mut m = ParkingModule::synthetic();
        let mut last_reverse = None;
        for _ in 0..20 {
            let p = parking(&mut m);
            if p.reverse_engaged {
                last_reverse = Some(p.rear_left.distance_cm);
            }
        }
        let after = parking(&mut m);
        assert!(!after.reverse_engaged);
        assert_eq!(after.rear_left.warning, ProximityWarning::Inactive);
        assert_eq!(Some(after.rear_left.distance_cm), last_reverse);
    }

    struct Scripted(Vec<ParkingFrame>);

    impl ParkingDevice for Scripted {
        fn read(&mut self) -> Result<ParkingFrame, EvError> {
            if self.0.is_empty() {
                return Err(EvError::HardwareFault {
                    component: "gpio".to_string(),
                    details: "export failed".to_string(),
                });
            }
            Ok(self.0.remove(0))
        }
    }

    #[test]
    fn device_echo_timeout_keeps_previous_distance() {
        let mut m = ParkingModule::with_device(Box::new(Scripted(vec![
            ParkingFrame {
                reverse_engaged: true,
                motion_detected: false,
                rear_left_cm: Some(25.0),
                rear_right_cm: Some(8.0),
            },
            ParkingFrame {
                reverse_engaged: true,
                motion_detected: true,
                rear_left_cm: None,
                rear_right_cm: Some(40.0),
            },
        ])));

        let first = parking(&mut m);
        assert_eq!(first.rear_left.warning, ProximityWarning::Low);
        assert_eq!(first.rear_right.warning, ProximityWarning::High);

        let second = parking(&mut m);
        assert!(second.motion_detected);
        assert_eq!(second.rear_left.distance_cm, 25.0);
        assert_eq!(second.rear_left.warning, ProximityWarning::Inactive);
        assert_eq!(second.rear_right.warning, ProximityWarning::Clear);

        assert!(m.poll().is_degraded());
    }
}
