//! `evdash-types` – shared vocabulary for the telemetry/command channel.
//!
//! Every other crate in the workspace speaks in terms of these types:
//!
//! - [`snapshot`] – [`VehicleSnapshot`], the complete point-in-time vehicle
//!   state broadcast once per tick, and its structured blocks.
//! - [`reading`] – [`Reading`], the per-source sample a hardware source
//!   yields on every poll.
//! - [`command`] – [`Command`], the closed tagged union of whitelisted
//!   control actions, and [`CommandEnvelope`] for parsing raw client text.
//! - [`message`] – [`ServerMessage`], the JSON frames sent to clients.

pub mod command;
pub mod message;
pub mod reading;
pub mod snapshot;

pub use command::{
    COMMAND_WHITELIST, Command, CommandEnvelope, CommandError, CommandTarget, GpsUpdate,
};
pub use message::{ResponseStatus, ServerMessage, encode_telemetry};
pub use reading::{ClimateSample, Reading, SourceKind, VehicleBusFrame};
pub use snapshot::{
    BatteryCells, Connectivity, DriveMode, GpsFix, MediaState, ParkingState, Proximity,
    ProximityWarning, RegenLevel, TirePressure, TwinMode, VehicleSettings, VehicleSnapshot,
};

use thiserror::Error;

/// Error type spanning hardware faults, transport failures and channel
/// shutdown across the whole workspace.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvError {
    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Command Rejected: {0}")]
    Rejected(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Channel Closed: {0}")]
    Channel(String),

    #[error("Bind Error on {addr}: {details}")]
    Bind { addr: String, details: String },
}

impl From<serde_json::Error> for EvError {
    fn from(e: serde_json::Error) -> Self {
        EvError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ev_error_display() {
        let err = EvError::HardwareFault {
            component: "climate".to_string(),
            details: "checksum mismatch".to_string(),
        };
        assert!(err.to_string().contains("climate"));
        assert!(err.to_string().contains("checksum mismatch"));

        let err = EvError::Bind {
            addr: "0.0.0.0:8765".to_string(),
            details: "address in use".to_string(),
        };
        assert!(err.to_string().contains("0.0.0.0:8765"));
    }

    #[test]
    fn serde_json_error_converts_to_serialization() {
        let err: EvError = serde_json::from_str::<u8>("nope").unwrap_err().into();
        assert!(matches!(err, EvError::Serialization(_)));
    }
}
