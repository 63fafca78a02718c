//! Server → client wire frames.
//!
//! One JSON object per WebSocket text message, discriminated by `type`:
//!
//! | `type` | Payload |
//! |---|---|
//! | `connection` | `{status, message}` – sent once on accept |
//! | `telemetry` | every [`VehicleSnapshot`] field at top level |
//! | `response` | `{action, status, reason?, value?, request_id?}` |
//! | `error` | `{message}` – protocol-level failure |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CommandError;
use crate::snapshot::VehicleSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// A frame pushed from the broadcast server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        status: String,
        message: String,
    },
    Telemetry(Box<VehicleSnapshot>),
    #[serde(alias = "command_response")]
    Response {
        action: String,
        status: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Connection {
            status: "connected".to_string(),
            message: "Connected to EV Backend Server".to_string(),
        }
    }

    pub fn success(action: &str, value: Option<Value>, request_id: Option<String>) -> Self {
        ServerMessage::Response {
            action: action.to_string(),
            status: ResponseStatus::Success,
            reason: None,
            value,
            request_id,
        }
    }

    pub fn rejected(action: &str, reason: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Response {
            action: action.to_string(),
            status: ResponseStatus::Error,
            reason: Some(reason.into()),
            value: None,
            request_id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Map a parse/validation failure to the frame the client should see.
    ///
    /// Framing failures become `error`; everything else is a correlated
    /// `response` carrying the action name (or `"unknown"` when absent).
    pub fn from_command_error(
        err: &CommandError,
        action: Option<&str>,
        request_id: Option<String>,
    ) -> Self {
        if err.is_protocol() {
            return ServerMessage::error(err.to_string());
        }
        ServerMessage::rejected(action.unwrap_or("unknown"), err.to_string(), request_id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Serialize)]
struct TelemetryFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    snapshot: &'a VehicleSnapshot,
}

/// Serialise a snapshot as a `telemetry` frame without cloning it.
pub fn encode_telemetry(snapshot: &VehicleSnapshot) -> serde_json::Result<String> {
    serde_json::to_string(&TelemetryFrame {
        kind: "telemetry",
        snapshot,
    })
}
