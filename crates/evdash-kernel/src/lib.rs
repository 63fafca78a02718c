//! `evdash-kernel` – state ownership and command policy
//!
//! Owns the canonical vehicle state and decides which commands may change
//! it.
//!
//! # Modules
//!
//! - [`aggregator`] – [`StateAggregator`]: the tick loop that polls every
//!   hardware source, merges readings into a new snapshot and publishes it,
//!   plus the [`AggregatorHandle`] commands are submitted through.
//! - [`validator`] – [`CommandValidator`]: rule engine enforcing value ranges
//!   (charge limit, brightness, volume, GPS bounds, Bluetooth addresses).
//! - [`dispatcher`] – [`CommandDispatcher`]: parse → decode → validate →
//!   apply, producing exactly one response per inbound frame.
//! - [`watchdog`] – [`Watchdog`]: per-source heartbeat tracking behind
//!   `stale_sources`.

pub mod aggregator;
pub mod dispatcher;
pub mod validator;
pub mod watchdog;

pub use aggregator::{AggregatorConfig, AggregatorHandle, ApplyOutcome, StateAggregator};
pub use dispatcher::CommandDispatcher;
pub use validator::{BluetoothAddressRule, CommandValidator, GpsFixRule, RangeRule, Rule};
pub use watchdog::{ComponentHealth, Watchdog};
