//! Generic [`HardwareSource`] trait implemented by every sensor/actuator
//! variant.
//!
//! Sources register themselves with a
//! [`SourceRegistry`][crate::registry::SourceRegistry].  The aggregator only
//! ever talks to the trait, so a synthetic source can be swapped for a real
//! driver without touching aggregation or dispatch logic.

use evdash_types::{Command, EvError, Reading, SourceKind};

/// How a side-effecting command was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Executed against a physical device and mirrored.
    Applied,
    /// No device attached; only the mirrored synthetic state changed.
    Mirrored,
}

/// A pollable hardware source.
///
/// Implementations must never panic or block indefinitely inside
/// [`poll`][Self::poll]: a failed read is reported as
/// [`Reading::Degraded`] and the caller keeps the last-known values.
pub trait HardwareSource: Send {
    /// Stable identifier, e.g. `"climate"` or `"gnss"`.
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// `true` when no physical device backs this source.
    fn is_synthetic(&self) -> bool;

    /// Return the most recent sample.
    fn poll(&mut self) -> Reading;

    /// Execute a side-effecting command owned by this source.
    ///
    /// Either the whole command takes effect or none of it does.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::Rejected`] for commands this source does not own
    /// and [`EvError::HardwareFault`] when the device refuses the write.
    fn apply(&mut self, command: &Command) -> Result<Ack, EvError> {
        Err(EvError::Rejected(format!(
            "source '{}' does not accept {}",
            self.id(),
            command.action()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdash_types::ClimateSample;

    struct ReadOnly;

    impl HardwareSource for ReadOnly {
        fn id(&self) -> &str {
            "read_only"
        }
        fn kind(&self) -> SourceKind {
            SourceKind::Climate
        }
        fn is_synthetic(&self) -> bool {
            true
        }
        fn poll(&mut self) -> Reading {
            Reading::Climate(ClimateSample {
                ambient_temp: 20.0,
                humidity: 40.0,
                cabin_temp: None,
            })
        }
    }

    #[test]
    fn default_apply_rejects() {
        let mut src = ReadOnly;
        let err = src.apply(&Command::PlayMusic).unwrap_err();
        assert!(matches!(err, EvError::Rejected(_)));
        assert!(err.to_string().contains("play_music"));
    }
}
