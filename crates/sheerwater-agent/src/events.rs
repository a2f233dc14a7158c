//! Turn progress events

use serde::{Deserialize, Serialize};
use sheerwater_ai::Usage;

/// Events emitted while a turn runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The user message was stored and the tool-use loop is starting
    TurnStart { conversation_id: String },

    /// About to call the model for the given step (1-based)
    ModelRequest { conversation_id: String, step: u32 },

    /// Tool execution started
    ToolExecutionStart {
        conversation_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution completed
    ToolExecutionEnd {
        conversation_id: String,
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },

    /// The turn finished, completely or at the step bound
    TurnEnd {
        conversation_id: String,
        steps: u32,
        usage: Usage,
        incomplete: bool,
    },

    /// The turn failed
    Error {
        conversation_id: String,
        message: String,
    },
}

impl TurnEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::TurnEnd { .. } | TurnEvent::Error { .. })
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            TurnEvent::TurnStart { conversation_id }
            | TurnEvent::ModelRequest { conversation_id, .. }
            | TurnEvent::ToolExecutionStart { conversation_id, .. }
            | TurnEvent::ToolExecutionEnd { conversation_id, .. }
            | TurnEvent::TurnEnd { conversation_id, .. }
            | TurnEvent::Error { conversation_id, .. } => conversation_id,
        }
    }
}
