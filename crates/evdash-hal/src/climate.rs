//! Temperature/humidity sensor source.
//!
//! DHT-class sensors cannot be sampled more often than every couple of
//! seconds, so a good sample is served from cache for
//! [`MIN_SAMPLE_INTERVAL`] before the device is read again.

use std::time::{Duration, Instant};

use evdash_types::{ClimateSample, EvError, Reading, SourceKind};
use tracing::warn;

use crate::round_to;
use crate::source::HardwareSource;

/// Minimum time between two physical reads.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(2500);

/// A temperature/humidity device driver.
pub trait ClimateDevice: Send {
    /// Return `(temperature_c, humidity_pct)`.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::HardwareFault`] on checksum or timing failures.
    fn read(&mut self) -> Result<(f64, f64), EvError>;
}

pub struct ClimateSensor {
    id: String,
    device: Option<Box<dyn ClimateDevice>>,
    cache: Option<(Instant, ClimateSample)>,
    step: u64,
}

impl ClimateSensor {
    /// A synthetic sensor.
    pub fn synthetic() -> Self {
        Self {
            id: "climate".to_string(),
            device: None,
            cache: None,
            step: 0,
        }
    }

    /// A sensor backed by a physical device.
    pub fn with_device(device: Box<dyn ClimateDevice>) -> Self {
        Self {
            device: Some(device),
            ..Self::synthetic()
        }
    }

    // Slow drift between 24–28 °C and 50–58 %, with a small deterministic
    // ripple so consecutive ticks differ.
    fn synthetic_sample(&mut self) -> ClimateSample {
        let t = self.step as f64;
        self.step += 1;
        let ambient = 24.0 + (self.step % 300) as f64 / 300.0 * 4.0 + 0.4 * (t * 0.7).sin();
        let humidity = 50.0 + (self.step % 180) as f64 / 180.0 * 8.0 + 1.5 * (t * 0.3).sin();
        ClimateSample {
            ambient_temp: round_to(ambient, 1),
            humidity: round_to(humidity, 1),
            cabin_temp: None,
        }
    }
}

impl HardwareSource for ClimateSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Climate
    }

    fn is_synthetic(&self) -> bool {
        self.device.is_none()
    }

    fn poll(&mut self) -> Reading {
        let Some(device) = self.device.as_mut() else {
            return Reading::Climate(self.synthetic_sample());
        };

        if let Some((at, sample)) = &self.cache
            && at.elapsed() < MIN_SAMPLE_INTERVAL
        {
            return Reading::Climate(sample.clone());
        }

        match device.read() {
            Ok((temperature, humidity)) => {
                let sample = ClimateSample {
                    ambient_temp: round_to(temperature, 1),
                    humidity: round_to(humidity, 1),
                    cabin_temp: None,
                };
                self.cache = Some((Instant::now(), sample.clone()));
                Reading::Climate(sample)
            }
            Err(e) => {
                warn!(source = %self.id, error = %e, "climate read failed");
                Reading::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDevice {
        reads: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ClimateDevice for CountingDevice {
        fn read(&mut self) -> Result<(f64, f64), EvError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EvError::HardwareFault {
                    component: "dht11".to_string(),
                    details: "checksum mismatch".to_string(),
                })
            } else {
                Ok((23.44, 41.06))
            }
        }
    }

    #[test]
    fn synthetic_sensor_stays_in_range() {
        let mut sensor = ClimateSensor::synthetic();
        assert!(sensor.is_synthetic());
        for _ in 0..600 {
            let Reading::Climate(s) = sensor.poll() else {
                panic!("synthetic climate must never degrade");
            };
            assert!((23.0..=29.0).contains(&s.ambient_temp), "{}", s.ambient_temp);
            assert!((48.0..=60.0).contains(&s.humidity), "{}", s.humidity);
        }
    }

    #[test]
    fn synthetic_sensor_is_deterministic() {
        let mut a = ClimateSensor::synthetic();
        let mut b = ClimateSensor::synthetic();
        for _ in 0..20 {
            assert_eq!(a.poll(), b.poll());
        }
    }

    #[test]
    fn device_reads_are_rate_limited() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut sensor = ClimateSensor::with_device(Box::new(CountingDevice {
            reads: Arc::clone(&reads),
            fail: false,
        }));
        assert!(!sensor.is_synthetic());

        let first = sensor.poll();
        let second = sensor.poll();
        assert_eq!(first, second);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        if let Reading::Climate(s) = first {
            assert!((s.ambient_temp - 23.4).abs() < 1e-9);
            assert!((s.humidity - 41.1).abs() < 1e-9);
        }
    }

    #[test]
    fn device_failure_degrades() {
        let mut sensor = ClimateSensor::with_device(Box::new(CountingDevice {
            reads: Arc::new(AtomicUsize::new(0)),
            fail: true,
        }));
        assert!(sensor.poll().is_degraded());
    }
}
