//! [`CommandDispatcher`] – the single path from raw client text to the
//! canonical state.
//!
//! ```text
//! raw text ──parse──► envelope ──decode──► Command ──validate──► aggregator
//!     │                   │                   │                      │
//!     └── error frame     └── rejected        └── rejected           └── success / rejected
//! ```
//!
//! Every call yields exactly one [`ServerMessage`]: a correlated `response`
//! for anything that carried an action, or an `error` frame for text that was
//! not a JSON object at all.

use std::sync::Arc;

use evdash_types::{Command, CommandEnvelope, EvError, ServerMessage};
use tracing::{info, warn};

use crate::aggregator::AggregatorHandle;
use crate::validator::CommandValidator;

/// Cheap to clone; one instance is shared by every client session.
#[derive(Clone)]
pub struct CommandDispatcher {
    validator: Arc<CommandValidator>,
    aggregator: AggregatorHandle,
}

impl CommandDispatcher {
    pub fn new(validator: CommandValidator, aggregator: AggregatorHandle) -> Self {
        Self {
            validator: Arc::new(validator),
            aggregator,
        }
    }

    /// Handle one inbound text frame.
    pub async fn dispatch(&self, raw: &str) -> ServerMessage {
        let envelope = match CommandEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "unparseable command frame");
                return ServerMessage::from_command_error(&e, None, None);
            }
        };

        let action = envelope.action.clone();
        let request_id = envelope.request_id.clone();
        match envelope.into_command() {
            Ok(command) => self.dispatch_command(command, request_id).await,
            Err(e) => {
                warn!(action = action.as_deref().unwrap_or("unknown"), error = %e, "command rejected");
                ServerMessage::from_command_error(&e, action.as_deref(), request_id)
            }
        }
    }

    /// Validate and apply an already-decoded command.
    pub async fn dispatch_command(
        &self,
        command: Command,
        request_id: Option<String>,
    ) -> ServerMessage {
        let action = command.action();
        if let Err(e) = self.validator.validate(&command) {
            warn!(action, error = %e, "command rejected");
            return ServerMessage::rejected(action, e.to_string(), request_id);
        }

        let value = command.echo_value();
        match self.aggregator.apply(command).await {
            Ok(outcome) => {
                info!(action, ?outcome, "command accepted");
                ServerMessage::success(action, value, request_id)
            }
            Err(e) => {
                let reason = match e {
                    EvError::Rejected(reason) => reason,
                    EvError::Channel(_) => "server is shutting down".to_string(),
                    other => other.to_string(),
                };
                warn!(action, %reason, "command failed");
                ServerMessage::rejected(action, reason, request_id)
            }
        }
    }
}
