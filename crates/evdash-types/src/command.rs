//! [`Command`] – the closed set of control actions a client may request.
//!
//! Raw client text is parsed in two steps so a failure can always be
//! correlated back to the request:
//!
//! 1. [`CommandEnvelope::parse`] checks the JSON framing and lifts out the
//!    `action` and optional `request_id`.
//! 2. [`CommandEnvelope::into_command`] checks the action against
//!    [`COMMAND_WHITELIST`] and decodes the typed payload.
//!
//! Range policy (charge limit bounds and so on) is enforced later by the
//! command validator; this module only guarantees shape and type.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::reading::SourceKind;
use crate::snapshot::{DriveMode, RegenLevel, TwinMode};

/// Every action name the dispatcher will ever accept.
pub const COMMAND_WHITELIST: [&str; 14] = [
    "play_music",
    "pause_music",
    "next_track",
    "previous_track",
    "set_volume",
    "set_charge_limit",
    "set_regen_level",
    "set_drive_mode",
    "set_brightness",
    "set_theme",
    "toggle_predictions",
    "set_twin_mode",
    "connect_bluetooth",
    "update_gps",
];

/// A whitelisted control action with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    PlayMusic,
    PauseMusic,
    NextTrack,
    PreviousTrack,
    SetVolume {
        volume: f64,
    },
    SetChargeLimit {
        #[serde(deserialize_with = "whole_number")]
        value: i64,
    },
    SetRegenLevel {
        value: RegenLevel,
    },
    SetDriveMode {
        value: DriveMode,
    },
    SetBrightness {
        #[serde(deserialize_with = "whole_number")]
        value: i64,
    },
    /// `true` selects the light theme.
    SetTheme {
        value: bool,
    },
    TogglePredictions {
        value: bool,
    },
    SetTwinMode {
        value: TwinMode,
    },
    ConnectBluetooth {
        device_address: String,
    },
    UpdateGps(GpsUpdate),
}

/// Externally supplied position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsUpdate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Where a command takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    /// Pure settings change applied to the canonical state.
    Settings,
    /// Side-effecting command owned by a hardware source.
    Source(SourceKind),
}

impl Command {
    /// The wire name of this command's action.
    pub fn action(&self) -> &'static str {
        match self {
            Command::PlayMusic => "play_music",
            Command::PauseMusic => "pause_music",
            Command::NextTrack => "next_track",
            Command::PreviousTrack => "previous_track",
            Command::SetVolume { .. } => "set_volume",
            Command::SetChargeLimit { .. } => "set_charge_limit",
            Command::SetRegenLevel { .. } => "set_regen_level",
            Command::SetDriveMode { .. } => "set_drive_mode",
            Command::SetBrightness { .. } => "set_brightness",
            Command::SetTheme { .. } => "set_theme",
            Command::TogglePredictions { .. } => "toggle_predictions",
            Command::SetTwinMode { .. } => "set_twin_mode",
            Command::ConnectBluetooth { .. } => "connect_bluetooth",
            Command::UpdateGps(_) => "update_gps",
        }
    }

    pub fn target(&self) -> CommandTarget {
        match self {
            Command::PlayMusic
            | Command::PauseMusic
            | Command::NextTrack
            | Command::PreviousTrack
            | Command::SetVolume { .. }
            | Command::ConnectBluetooth { .. } => CommandTarget::Source(SourceKind::Media),
            Command::UpdateGps(_) => CommandTarget::Source(SourceKind::Gnss),
            Command::SetChargeLimit { .. }
            | Command::SetRegenLevel { .. }
            | Command::SetDriveMode { .. }
            | Command::SetBrightness { .. }
            | Command::SetTheme { .. }
            | Command::TogglePredictions { .. }
            | Command::SetTwinMode { .. } => CommandTarget::Settings,
        }
    }

    /// The payload value echoed back in a success response, if any.
    pub fn echo_value(&self) -> Option<Value> {
        match self {
            Command::SetChargeLimit { value } | Command::SetBrightness { value } => {
                Some(Value::from(*value))
            }
            Command::SetRegenLevel { value } => serde_json::to_value(value).ok(),
            Command::SetDriveMode { value } => serde_json::to_value(value).ok(),
            Command::SetTwinMode { value } => serde_json::to_value(value).ok(),
            Command::SetTheme { value } | Command::TogglePredictions { value } => {
                Some(Value::Bool(*value))
            }
            Command::SetVolume { volume } => Some(Value::from(*volume)),
            _ => None,
        }
    }
}

/// Largest integer an `f64` represents exactly.
const MAX_EXACT: f64 = 9_007_199_254_740_992.0;

/// Accepts `80` and `80.0` alike; Dart/JS clients send slider values as
/// doubles. Any whole number decodes here, bounds are the validator's job.
fn whole_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = f64::deserialize(deserializer)?;
    if v.fract() != 0.0 || !(-MAX_EXACT..=MAX_EXACT).contains(&v) {
        return Err(de::Error::custom(format!("expected a whole number, got {v}")));
    }
    Ok(v as i64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Failure to turn client text into a [`Command`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Invalid JSON format: {0}")]
    Malformed(String),

    #[error("Missing or non-string action")]
    MissingAction,

    #[error("Invalid action: {0}")]
    UnknownAction(String),

    #[error("Invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("{action} rejected: {reason}")]
    OutOfRange { action: String, reason: String },
}

impl CommandError {
    /// `true` for failures of the message framing itself, which are reported
    /// with a protocol-level `error` frame rather than a correlated response.
    pub fn is_protocol(&self) -> bool {
        matches!(self, CommandError::Malformed(_))
    }
}

/// A syntactically valid command request whose action has not yet been
/// checked.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub action: Option<String>,
    pub request_id: Option<String>,
    body: Value,
}

impl CommandEnvelope {
    /// Parse raw client text.  Only fails when the text is not a JSON object.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let body: Value =
            serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))?;
        let Value::Object(map) = &body else {
            return Err(CommandError::Malformed("expected a JSON object".to_string()));
        };
        let action = map.get("action").and_then(Value::as_str).map(str::to_owned);
        let request_id = map.get("request_id").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        Ok(Self {
            action,
            request_id,
            body,
        })
    }

    /// Check the whitelist and decode the typed payload.
    pub fn into_command(self) -> Result<Command, CommandError> {
        let Some(action) = self.action else {
            return Err(CommandError::MissingAction);
        };
        if !COMMAND_WHITELIST.contains(&action.as_str()) {
            return Err(CommandError::UnknownAction(action));
        }
        Command::deserialize(self.body).map_err(|e| CommandError::InvalidPayload {
            action,
            reason: e.to_string(),
        })
    }
}
