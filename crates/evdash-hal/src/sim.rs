//! [`SimRegistry`] – builds a [`SourceRegistry`] from synthetic sources.
//!
//! Used by the server when no hardware is attached, by the client's offline
//! fallback feed, and throughout the test suites.
//!
//! # Example
//!
//! ```rust
//! use evdash_hal::sim::SimRegistry;
//!
//! let registry = SimRegistry::builder()
//!     .with_climate()
//!     .with_vehicle_bus()
//!     .build();
//! assert_eq!(registry.len(), 2);
//! ```

use std::time::Duration;

use tracing::info;

use crate::climate::ClimateSensor;
use crate::gnss::GnssModule;
use crate::media::MediaController;
use crate::parking::ParkingModule;
use crate::registry::{DEFAULT_POLL_TIMEOUT, SourceRegistry};
use crate::source::HardwareSource;
use crate::vehicle_bus::VehicleBus;

/// Which hardware the process is expected to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalProfile {
    /// Developer workstation: every source is synthetic.
    Desktop,
    /// ARM single-board computer wired to the vehicle.
    Embedded,
}

impl HalProfile {
    /// Guess the profile from the target architecture.
    pub fn detect() -> Self {
        if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            HalProfile::Embedded
        } else {
            HalProfile::Desktop
        }
    }
}

/// Builder for a registry of synthetic sources.
pub struct SimRegistry {
    sources: Vec<Box<dyn HardwareSource>>,
    poll_timeout: Duration,
}

impl SimRegistry {
    pub fn builder() -> Self {
        Self {
            sources: Vec::new(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// All five synthetic sources.
    pub fn full() -> Self {
        Self::builder()
            .with_climate()
            .with_vehicle_bus()
            .with_gnss()
            .with_media()
            .with_parking()
    }

    pub fn with_climate(self) -> Self {
        self.with_source(Box::new(ClimateSensor::synthetic()))
    }

    pub fn with_vehicle_bus(self) -> Self {
        self.with_source(Box::new(VehicleBus::synthetic()))
    }

    pub fn with_gnss(self) -> Self {
        self.with_source(Box::new(GnssModule::synthetic()))
    }

    pub fn with_media(self) -> Self {
        self.with_source(Box::new(MediaController::synthetic()))
    }

    pub fn with_parking(self) -> Self {
        self.with_source(Box::new(ParkingModule::synthetic()))
    }

    /// Add an arbitrary source, e.g. a real driver next to synthetic ones.
    pub fn with_source(mut self, source: Box<dyn HardwareSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn build(self) -> SourceRegistry {
        let mut registry = SourceRegistry::with_poll_timeout(self.poll_timeout);
        for source in self.sources {
            registry.register(source);
        }
        registry
    }
}

/// The registry the server starts with for a given profile.
///
/// No physical drivers ship with this crate, so both profiles currently
/// resolve to synthetic sources; the embedded profile only changes what is
/// logged so an operator notices missing drivers.
pub fn registry_for(profile: HalProfile, poll_timeout: Duration) -> SourceRegistry {
    let registry = SimRegistry::full().with_poll_timeout(poll_timeout).build();
    match profile {
        HalProfile::Desktop => {
            info!(sources = registry.len(), "desktop profile: synthetic sources")
        }
        HalProfile::Embedded => info!(
            sources = registry.len(),
            "embedded profile without device drivers: falling back to synthetic sources"
        ),
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdash_types::SourceKind;

    #[test]
    fn full_registers_all_kinds() {
        let registry = SimRegistry::full().build();
        assert_eq!(registry.len(), 5);
        for kind in [
            SourceKind::Climate,
            SourceKind::VehicleBus,
            SourceKind::Gnss,
            SourceKind::Media,
            SourceKind::Parking,
        ] {
            assert!(registry.contains(kind), "{kind} missing");
        }
        assert!(registry.describe().iter().all(|(_, _, synthetic)| *synthetic));
    }

    #[test]
    fn poll_timeout_is_forwarded() {
        let registry = SimRegistry::builder()
            .with_poll_timeout(Duration::from_millis(42))
            .build();
        assert!(registry.is_empty());
        assert_eq!(registry.poll_timeout(), Duration::from_millis(42));
    }

    #[tokio::test]
    async fn synthetic_registry_never_degrades() {
        let registry = registry_for(HalProfile::detect(), DEFAULT_POLL_TIMEOUT);
        for _ in 0..5 {
            let readings = registry.poll_all().await;
            assert_eq!(readings.len(), 5);
            assert!(readings.iter().all(|r| !r.reading.is_degraded()));
        }
    }
}
