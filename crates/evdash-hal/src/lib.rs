//! `evdash-hal` – Hardware Source Abstraction
//!
//! A uniform polling interface over the vehicle's heterogeneous sensors and
//! actuators.  Every source yields a real reading when its device is attached
//! and a deterministic synthetic one when it is not, so the rest of the
//! system stays observable and controllable on a desktop.
//!
//! # Modules
//!
//! - [`source`] – the [`HardwareSource`] capability trait (`poll` / `apply`).
//! - [`climate`], [`vehicle_bus`], [`gnss`], [`media`], [`parking`] – the
//!   source variants, each with its device trait (the `read()`/`write()`
//!   contract a real driver implements).
//! - [`registry`] – [`SourceRegistry`]: owns every source behind a
//!   per-source lock and polls them concurrently under a bounded timeout.
//! - [`sim`] – [`SimRegistry`] builder and [`HalProfile`] platform detection.

pub mod climate;
pub mod gnss;
pub mod media;
pub mod parking;
pub mod registry;
pub mod sim;
pub mod source;
pub mod vehicle_bus;

pub use climate::{ClimateDevice, ClimateSensor};
pub use gnss::{GnssDevice, GnssModule};
pub use media::{MediaController, MediaDevice};
pub use parking::{ParkingDevice, ParkingFrame, ParkingModule};
pub use registry::{DEFAULT_POLL_TIMEOUT, PolledReading, SourceRegistry};
pub use sim::{HalProfile, SimRegistry, registry_for};
pub use source::{Ack, HardwareSource};
pub use vehicle_bus::{VehicleBus, VehicleBusDevice};

/// Round to `decimals` places, matching the precision the dashboard shows.
pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
