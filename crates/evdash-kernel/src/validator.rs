//! [`CommandValidator`] – range rules applied to every decoded command.
//!
//! Decoding already guarantees a command's shape: the action is whitelisted
//! and every payload field has the right type. The validator adds the value
//! policy. Every registered [`Rule`] is evaluated in order, and the first
//! violation rejects the command before anything is applied.

use evdash_types::{Command, CommandError};

/// A single value constraint a command must satisfy.
pub trait Rule: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`CommandError::OutOfRange`] when the command violates the rule.
    fn check(&self, command: &Command) -> Result<(), CommandError>;
}

/// Rule engine run by the dispatcher.
///
/// # Example
///
/// ```
/// use evdash_kernel::validator::CommandValidator;
/// use evdash_types::Command;
///
/// let validator = CommandValidator::standard();
/// assert!(validator.validate(&Command::SetChargeLimit { value: 80 }).is_ok());
/// assert!(validator.validate(&Command::SetChargeLimit { value: 120 }).is_err());
/// ```
#[derive(Default)]
pub struct CommandValidator {
    rules: Vec<Box<dyn Rule>>,
}

impl CommandValidator {
    /// A validator with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// The production rule set.
    pub fn standard() -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(RangeRule {
            action: "set_charge_limit",
            field: "value",
            min: 50.0,
            max: 100.0,
            extract: |c| match c {
                Command::SetChargeLimit { value } => Some(*value as f64),
                _ => None,
            },
        }));
        v.add_rule(Box::new(RangeRule {
            action: "set_brightness",
            field: "value",
            min: 10.0,
            max: 100.0,
            extract: |c| match c {
                Command::SetBrightness { value } => Some(*value as f64),
                _ => None,
            },
        }));
        v.add_rule(Box::new(RangeRule {
            action: "set_volume",
            field: "volume",
            min: 0.0,
            max: 1.0,
            extract: |c| match c {
                Command::SetVolume { volume } => Some(*volume),
                _ => None,
            },
        }));
        v.add_rule(Box::new(GpsFixRule));
        v.add_rule(Box::new(BluetoothAddressRule));
        v
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    /// # Errors
    ///
    /// Returns the first violation.
    pub fn validate(&self, command: &Command) -> Result<(), CommandError> {
        for rule in &self.rules {
            rule.check(command)?;
        }
        Ok(())
    }
}

fn out_of_range(command: &Command, reason: String) -> CommandError {
    CommandError::OutOfRange {
        action: command.action().to_string(),
        reason,
    }
}

/// Inclusive numeric bounds on one payload field of one action.
pub struct RangeRule {
    pub action: &'static str,
    pub field: &'static str,
    pub min: f64,
    pub max: f64,
    pub extract: fn(&Command) -> Option<f64>,
}

impl Rule for RangeRule {
    fn name(&self) -> &str {
        self.action
    }

    fn check(&self, command: &Command) -> Result<(), CommandError> {
        match (self.extract)(command) {
            Some(v) if !v.is_finite() || v < self.min || v > self.max => Err(out_of_range(
                command,
                format!("{} {v} outside [{}, {}]", self.field, self.min, self.max),
            )),
            _ => Ok(()),
        }
    }
}

/// Coordinate and motion bounds for injected fixes.
pub struct GpsFixRule;

impl Rule for GpsFixRule {
    fn name(&self) -> &str {
        "gps_fix"
    }

    fn check(&self, command: &Command) -> Result<(), CommandError> {
        let Command::UpdateGps(fix) = command else {
            return Ok(());
        };
        let fail = |reason: String| Err(out_of_range(command, reason));

        if !fix.latitude.is_finite() || !(-90.0..=90.0).contains(&fix.latitude) {
            return fail(format!("latitude {} outside [-90, 90]", fix.latitude));
        }
        if !fix.longitude.is_finite() || !(-180.0..=180.0).contains(&fix.longitude) {
            return fail(format!("longitude {} outside [-180, 180]", fix.longitude));
        }
        if let Some(h) = fix.heading
            && !(0.0..360.0).contains(&h)
        {
            return fail(format!("heading {h} outside [0, 360)"));
        }
        if let Some(s) = fix.speed
            && !(s.is_finite() && s >= 0.0)
        {
            return fail(format!("speed {s} must be non-negative"));
        }
        if let Some(a) = fix.accuracy
            && !(a.is_finite() && a >= 0.0)
        {
            return fail(format!("accuracy {a} must be non-negative"));
        }
        if let Some(alt) = fix.altitude
            && !alt.is_finite()
        {
            return fail("altitude must be finite".to_string());
        }
        Ok(())
    }
}

/// `XX:XX:XX:XX:XX:XX` with hexadecimal octets.
pub struct BluetoothAddressRule;

impl BluetoothAddressRule {
    fn is_valid(address: &str) -> bool {
        let octets: Vec<&str> = address.split(':').collect();
        octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

impl Rule for BluetoothAddressRule {
    fn name(&self) -> &str {
        "bluetooth_address"
    }

    fn check(&self, command: &Command) -> Result<(), CommandError> {
        match command {
            Command::ConnectBluetooth { device_address } if !Self::is_valid(device_address) => {
                Err(out_of_range(
                    command,
                    format!("'{device_address}' is not a XX:XX:XX:XX:XX:XX address"),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdash_types::GpsUpdate;

    fn gps(latitude: f64, longitude: f64) -> GpsUpdate {
        GpsUpdate {
            latitude,
            longitude,
            altitude: None,
            speed: None,
            heading: None,
            accuracy: None,
        }
    }

    #[test]
    fn charge_limit_bounds_are_inclusive() {
        let v = CommandValidator::standard();
        assert!(v.validate(&Command::SetChargeLimit { value: 50 }).is_ok());
        assert!(v.validate(&Command::SetChargeLimit { value: 100 }).is_ok());
        assert!(v.validate(&Command::SetChargeLimit { value: 49 }).is_err());

        let err = v
            .validate(&Command::SetChargeLimit { value: 120 })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "set_charge_limit rejected: value 120 outside [50, 100]"
        );
    }

    #[test]
    fn values_beyond_a_byte_get_the_same_reason() {
        let v = CommandValidator::standard();
        let err = v
            .validate(&Command::SetChargeLimit { value: 300 })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "set_charge_limit rejected: value 300 outside [50, 100]"
        );
        let err = v
            .validate(&Command::SetBrightness { value: -5 })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "set_brightness rejected: value -5 outside [10, 100]"
        );
    }

    #[test]
    fn brightness_and_volume_ranges() {
        let v = CommandValidator::standard();
        assert!(v.validate(&Command::SetBrightness { value: 10 }).is_ok());
        assert!(v.validate(&Command::SetBrightness { value: 5 }).is_err());
        assert!(v.validate(&Command::SetVolume { volume: 0.0 }).is_ok());
        assert!(v.validate(&Command::SetVolume { volume: 1.5 }).is_err());
        assert!(v.validate(&Command::SetVolume { volume: f64::NAN }).is_err());
    }

    #[test]
    fn gps_bounds() {
        let v = CommandValidator::standard();
        assert!(v.validate(&Command::UpdateGps(gps(12.9, 77.5))).is_ok());
        assert!(v.validate(&Command::UpdateGps(gps(91.0, 0.0))).is_err());
        assert!(v.validate(&Command::UpdateGps(gps(0.0, -181.0))).is_err());

        let mut bad_heading = gps(0.0, 0.0);
        bad_heading.heading = Some(360.0);
        assert!(v.validate(&Command::UpdateGps(bad_heading)).is_err());

        let mut bad_speed = gps(0.0, 0.0);
        bad_speed.speed = Some(-1.0);
        assert!(v.validate(&Command::UpdateGps(bad_speed)).is_err());
    }

    #[test]
    fn bluetooth_address_format() {
        let v = CommandValidator::standard();
        let ok = Command::ConnectBluetooth {
            device_address: "a4:c1:38:0F:22:9B".to_string(),
        };
        assert!(v.validate(&ok).is_ok());
        for bad in ["", "A4:C1:38:0F:22", "A4:C1:38:0F:22:9G", "A4-C1-38-0F-22-9B"] {
            let cmd = Command::ConnectBluetooth {
                device_address: bad.to_string(),
            };
            assert!(v.validate(&cmd).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn unconstrained_commands_pass() {
        let v = CommandValidator::standard();
        assert!(v.validate(&Command::PlayMusic).is_ok());
        assert!(v.validate(&Command::SetTheme { value: true }).is_ok());
    }

    #[test]
    fn empty_validator_accepts_everything() {
        let v = CommandValidator::new();
        assert!(v.validate(&Command::SetChargeLimit { value: 255 }).is_ok());
    }
}
